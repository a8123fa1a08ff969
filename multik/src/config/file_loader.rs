use super::file_config::{AuthInfo, Cluster, Context, Kubeconfig};
use crate::error::ConfigError;

/// Options used when loading a kubeconfig file.
#[derive(Default, Clone, Debug, serde::Deserialize)]
pub struct ConnectOptions {
    /// The named context to load, defaulting to `current-context`
    pub context: Option<String>,
    /// Override the context's cluster
    pub cluster: Option<String>,
    /// Override the context's user
    pub user: Option<String>,
}

/// Loads one (context, cluster, user) triple out of a kubeconfig document.
#[derive(Clone, Debug)]
pub struct ConfigLoader {
    pub current_context: Context,
    pub cluster: Cluster,
    pub user: AuthInfo,
}

impl ConfigLoader {
    pub fn load(config: Kubeconfig, options: &ConnectOptions) -> Result<Self, ConfigError> {
        let context_name = if let Some(name) = &options.context {
            name
        } else if let Some(name) = &config.current_context {
            name
        } else {
            return Err(ConfigError::CurrentContextNotSet);
        };

        let current_context = config
            .contexts
            .iter()
            .find(|named| &named.name == context_name)
            .and_then(|named| named.context.clone())
            .ok_or_else(|| ConfigError::LoadContext {
                context_name: context_name.clone(),
            })?;

        let cluster_name = options.cluster.as_ref().unwrap_or(&current_context.cluster);
        let cluster = config
            .clusters
            .iter()
            .find(|named| &named.name == cluster_name)
            .and_then(|named| named.cluster.clone())
            .ok_or_else(|| ConfigError::LoadClusterOfContext {
                cluster_name: cluster_name.clone(),
            })?;

        let user_name = options.user.as_ref().unwrap_or(&current_context.user);
        let user = config
            .auth_infos
            .iter()
            .find(|named| &named.name == user_name)
            .and_then(|named| named.auth_info.clone())
            .ok_or_else(|| ConfigError::FindUser {
                user_name: user_name.clone(),
            })?;

        Ok(ConfigLoader {
            current_context,
            cluster,
            user,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_context_config() -> Kubeconfig {
        Kubeconfig::from_yaml(
            r#"
            clusters:
            - name: a
              cluster: { server: "https://a:6443" }
            - name: b
              cluster: { server: "https://b:6443" }
            users:
            - name: ua
              user: { token: ta }
            - name: ub
              user: { token: tb }
            contexts:
            - name: ctx-a
              context: { cluster: a, user: ua, namespace: ns-a }
            - name: ctx-b
              context: { cluster: b, user: ub }
            current-context: ctx-a
            "#,
        )
        .unwrap()
    }

    #[test]
    fn picks_current_context_by_default() {
        let loader = ConfigLoader::load(two_context_config(), &ConnectOptions::default()).unwrap();
        assert_eq!(loader.cluster.server.as_deref(), Some("https://a:6443"));
        assert_eq!(loader.current_context.namespace.as_deref(), Some("ns-a"));
    }

    #[test]
    fn context_and_overrides() {
        let opts = ConnectOptions {
            context: Some("ctx-b".into()),
            ..Default::default()
        };
        let loader = ConfigLoader::load(two_context_config(), &opts).unwrap();
        assert_eq!(loader.cluster.server.as_deref(), Some("https://b:6443"));

        let mixed = ConnectOptions {
            context: Some("ctx-b".into()),
            user: Some("ua".into()),
            ..Default::default()
        };
        let loader = ConfigLoader::load(two_context_config(), &mixed).unwrap();
        assert!(loader.user.token.is_some());
    }

    #[test]
    fn missing_context_errors() {
        let opts = ConnectOptions {
            context: Some("nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            ConfigLoader::load(two_context_config(), &opts),
            Err(ConfigError::LoadContext { .. })
        ));
    }
}
