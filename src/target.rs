use eyre::{eyre, Result};

use crate::api;

/// The user-facing target string, carried in the SSH login user. Two
/// grammars: `<user>@<device-uid>` (no dot on the right-hand side) and
/// `<user>@<namespace>.<hostname>` (split on the first dot).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Direct {
        username: String,
        device_uid: String,
    },
    Named {
        username: String,
        namespace: String,
        hostname: String,
    },
}

impl std::str::FromStr for Target {
    type Err = eyre::Report;

    fn from_str(sshid: &str) -> Result<Self> {
        let format = "format is <user>@<namespace>.<device> or <user>@<device-uid>";

        let (username, address) = sshid
            .split_once('@')
            .ok_or_else(|| eyre!(format).wrap_err(format!("invalid target: {sshid}")))?;

        if username.is_empty() || address.is_empty() {
            return Err(eyre!(format).wrap_err(format!("invalid target: {sshid}")));
        }

        match address.split_once('.') {
            None => Ok(Target::Direct {
                username: username.to_string(),
                device_uid: address.to_string(),
            }),
            Some((namespace, hostname)) => {
                if namespace.is_empty() || hostname.is_empty() {
                    return Err(eyre!(format).wrap_err(format!("invalid target: {sshid}")));
                }

                Ok(Target::Named {
                    username: username.to_string(),
                    namespace: namespace.to_lowercase(),
                    hostname: hostname.to_lowercase(),
                })
            }
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Direct {
                username,
                device_uid,
            } => write!(f, "{username}@{device_uid}"),
            Target::Named {
                username,
                namespace,
                hostname,
            } => write!(f, "{username}@{namespace}.{hostname}"),
        }
    }
}

impl Target {
    pub fn username(&self) -> &str {
        match self {
            Target::Direct { username, .. } | Target::Named { username, .. } => username,
        }
    }

    /// Resolve to the device document. Direct targets fetch by uid (the
    /// device doc fills in namespace and hostname); named targets go through
    /// lookup first.
    pub async fn resolve(&self, api: &api::Client, client_ip: &str) -> Result<api::Device> {
        match self {
            Target::Direct { device_uid, .. } => api.device(device_uid).await,
            Target::Named {
                username,
                namespace,
                hostname,
            } => {
                let uid = api
                    .lookup(&api::Lookup {
                        domain: namespace.clone(),
                        name: hostname.clone(),
                        username: username.clone(),
                        ip_address: client_ip.to_string(),
                    })
                    .await?;

                api.device(&uid).await
            }
        }
    }

    /// The tuple handed to firewall evaluation, built from the resolved
    /// device so both grammars end up with namespace and hostname filled.
    pub fn lookup(&self, device: &api::Device, client_ip: &str) -> api::Lookup {
        api::Lookup {
            domain: device.namespace.clone(),
            name: device.name.clone(),
            username: self.username().to_string(),
            ip_address: client_ip.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_targets_split_on_the_first_dot() {
        let target: Target = "root@acme.dev-01".parse().unwrap();
        assert_eq!(
            target,
            Target::Named {
                username: "root".to_string(),
                namespace: "acme".to_string(),
                hostname: "dev-01".to_string(),
            }
        );

        // Hostnames may themselves contain dots.
        let target: Target = "bob@ns.host.internal".parse().unwrap();
        assert_eq!(
            target,
            Target::Named {
                username: "bob".to_string(),
                namespace: "ns".to_string(),
                hostname: "host.internal".to_string(),
            }
        );
    }

    #[test]
    fn dotless_addresses_are_device_uids() {
        let target: Target = "bob@2dd0d9f54aee".parse().unwrap();
        assert_eq!(
            target,
            Target::Direct {
                username: "bob".to_string(),
                device_uid: "2dd0d9f54aee".to_string(),
            }
        );
    }

    #[test]
    fn namespace_and_hostname_are_lowercased() {
        let target: Target = "Bob@ACME.Dev-01".parse().unwrap();
        assert_eq!(
            target,
            Target::Named {
                // The device-side user keeps its case.
                username: "Bob".to_string(),
                namespace: "acme".to_string(),
                hostname: "dev-01".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn resolution_round_trips_through_the_api() {
        use warp::Filter;

        let lookup = warp::post()
            .and(warp::path!("internal" / "lookup"))
            .and(warp::body::json())
            .map(|body: api::Lookup| {
                assert_eq!(body.domain, "acme");
                assert_eq!(body.name, "dev-01");

                warp::reply::json(&serde_json::json!({ "uid": "D1" }))
            });

        let device = warp::get()
            .and(warp::path!("internal" / "devices" / String))
            .map(|uid: String| {
                warp::reply::json(&serde_json::json!({
                    "uid": uid,
                    "name": "dev-01",
                    "tenant_id": "T",
                    "namespace": "acme",
                    "info": { "version": "0.12.0" },
                }))
            });

        let (addr, server) = warp::serve(lookup.or(device)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = api::Client::new(format!("http://{addr}"));

        let target: Target = "root@ACME.Dev-01".parse().unwrap();
        let resolved = target.resolve(&client, "10.0.0.7").await.unwrap();
        assert_eq!(resolved.uid, "D1");

        // Fetching that uid directly lands on the same device.
        let direct: Target = "root@D1".parse().unwrap();
        let same = direct.resolve(&client, "10.0.0.7").await.unwrap();
        assert_eq!(same.uid, resolved.uid);

        let tuple = target.lookup(&resolved, "10.0.0.7");
        assert_eq!(
            tuple,
            api::Lookup {
                domain: "acme".to_string(),
                name: "dev-01".to_string(),
                username: "root".to_string(),
                ip_address: "10.0.0.7".to_string(),
            }
        );
    }

    #[test]
    fn targets_without_an_at_sign_fail() {
        assert!("rootacme.dev-01".parse::<Target>().is_err());
        assert!("@acme.dev-01".parse::<Target>().is_err());
        assert!("root@".parse::<Target>().is_err());
        assert!("root@acme.".parse::<Target>().is_err());
        assert!("root@.dev-01".parse::<Target>().is_err());
    }
}
