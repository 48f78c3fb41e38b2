use crate::constants::{CONFIG_MAP_KEY_SERVING_CONFIG, DOCUMENT_ROOT, JWKS_ENDPOINT_PATH};
use crate::convergence::{found, owned_labels, ConvergenceError, ConvergenceManager};
use crate::prelude::*;
use crate::store::resources::{ConfigMap, ObjectMeta};
use crate::target::{normalize_endpoint, JwksTarget};

/// Renders the serving configuration.
///
/// A single server block listens on `port` and answers every path with the
/// key-set document, so `/` and `/jwks.json` serve identical content.
///
/// # Errors
/// [`ConvergenceError::InvalidConfiguration`] if `key_set_name` is empty or
/// `endpoint` does not normalize to a plain absolute path.
pub fn render_serving_config(
    key_set_name: &str,
    endpoint: &str,
    port: u16,
    cache_max_age: u32,
) -> Result<String, ConvergenceError> {
    if key_set_name.is_empty() {
        return Err(ConvergenceError::InvalidConfiguration(
            "JWKS ConfigMap name cannot be empty".to_string(),
        ));
    }
    let endpoint = normalize_endpoint(endpoint);
    if !is_valid_endpoint(&endpoint) {
        return Err(ConvergenceError::InvalidConfiguration(format!(
            "invalid endpoint: {endpoint:?}"
        )));
    }

    Ok(format!(
        "server {{
    listen {port};
    server_name _;

    root {DOCUMENT_ROOT};

    # Security headers
    add_header X-Content-Type-Options \"nosniff\" always;
    add_header X-Frame-Options \"DENY\" always;
    add_header X-XSS-Protection \"1; mode=block\" always;

    location / {{
        default_type application/json;
        try_files {JWKS_ENDPOINT_PATH} =404;

        # CORS headers
        add_header Access-Control-Allow-Origin \"*\" always;
        add_header Access-Control-Allow-Methods \"GET, OPTIONS\" always;
        add_header Access-Control-Allow-Headers \"Content-Type\" always;

        # Cache control
        add_header Cache-Control \"public, max-age={cache_max_age}\" always;
    }}
}}"
    ))
}

fn is_valid_endpoint(endpoint: &str) -> bool {
    endpoint.starts_with('/')
        && !endpoint
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ';' | '{' | '}'))
}

impl ConvergenceManager {
    /// Ensures the serving-configuration object carries the rendered
    /// configuration. Returns whether the object was created or changed.
    ///
    /// The stored text is compared first; identical content is never rewritten.
    pub async fn ensure_serving_config(&self, target: &JwksTarget) -> Result<bool, ConvergenceError> {
        let namespace = target.namespace();
        let name = target.serving_config_name().ok_or_else(|| {
            ConvergenceError::InvalidConfiguration(
                "nginx ConfigMap name cannot be empty".to_string(),
            )
        })?;
        let rendered = render_serving_config(
            &target.spec.config_map_name,
            &target.endpoint(),
            self.nginx.port,
            self.nginx.cache_max_age,
        )?;

        match found(self.store.get_config_map(namespace, name).await)? {
            None => {
                let config_map = ConfigMap {
                    metadata: ObjectMeta::new(namespace, name)
                        .with_labels(owned_labels(target.name())),
                    data: [(CONFIG_MAP_KEY_SERVING_CONFIG.to_string(), rendered)]
                        .into_iter()
                        .collect(),
                    ..ConfigMap::default()
                };
                self.store.create_config_map(&config_map).await?;
                info!("nginx ConfigMap created: namespace={namespace}, config_map={name}");
                Ok(true)
            }
            Some(mut config_map) => {
                if config_map.data.get(CONFIG_MAP_KEY_SERVING_CONFIG) == Some(&rendered) {
                    debug!("nginx ConfigMap unchanged: namespace={namespace}, config_map={name}");
                    return Ok(false);
                }
                config_map
                    .data
                    .insert(CONFIG_MAP_KEY_SERVING_CONFIG.to_string(), rendered);
                self.store.update_config_map(&config_map).await?;
                info!("nginx ConfigMap updated: namespace={namespace}, config_map={name}");
                Ok(true)
            }
        }
    }
}
