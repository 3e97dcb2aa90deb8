use chrono::{DateTime, Utc};
use color_eyre::{Section, SectionExt};
use eyre::{eyre, Result};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceInfo {
    pub version: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    pub uid: String,
    pub name: String,
    pub tenant_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub info: Option<DeviceInfo>,
}

impl Device {
    pub fn version(&self) -> Option<Version> {
        self.info.as_ref()?.version.parse().ok()
    }
}

/// The opaque handle handed to firewall evaluation: who is connecting, from
/// where, to which device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lookup {
    pub domain: String,
    pub name: String,
    pub username: String,
    pub ip_address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub announcement: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PublicKey {
    pub fingerprint: String,
    pub data: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionRecord {
    pub uid: Uuid,
    pub device_uid: String,
    pub username: String,
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Identity {
    pub mac: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuthRequest {
    pub tenant_id: String,
    pub identity: Identity,
    pub hostname: String,
    pub public_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthResponse {
    pub uid: String,
    pub token: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug)]
pub enum FirewallError {
    Blocked,
    Unreachable,
    Unknown,
}

impl std::fmt::Display for FirewallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirewallError::Blocked => write!(f, "blocked by rule"),
            FirewallError::Unreachable => write!(f, "firewall unreachable"),
            FirewallError::Unknown => write!(f, "unknown firewall failure"),
        }
    }
}

impl std::error::Error for FirewallError {}

#[derive(Deserialize)]
struct LookupResponse {
    uid: String,
}

#[derive(Deserialize)]
struct BillingEvaluation {
    can_connect: bool,
}

#[derive(Deserialize)]
struct KeyResponse {
    data: String,
}

#[derive(Serialize)]
struct ConnectionStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disconnected_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct EvaluateKey<'a> {
    device_uid: &'a str,
    username: &'a str,
}

#[derive(Deserialize)]
struct Evaluation {
    allowed: bool,
}

async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let data = response.error_for_status()?.text().await?;

    let content: T =
        serde_path_to_error::deserialize(&mut serde_json::Deserializer::from_str(&data))
            .with_section(move || data.header("Response:"))?;

    Ok(content)
}

/// Client for the management API endpoints the gateway core consumes. The
/// API itself (devices, namespaces, users, policy) is designed elsewhere.
#[derive(Clone, Debug)]
pub struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base: String) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn device(&self, uid: &str) -> Result<Device> {
        parse(
            self.http
                .get(self.url(&format!("/internal/devices/{uid}")))
                .send()
                .await?,
        )
        .await
    }

    pub async fn lookup(&self, lookup: &Lookup) -> Result<String> {
        let found: LookupResponse = parse(
            self.http
                .post(self.url("/internal/lookup"))
                .json(lookup)
                .send()
                .await?,
        )
        .await?;

        Ok(found.uid)
    }

    pub async fn namespace(&self, tenant_id: &str) -> Result<Namespace> {
        parse(
            self.http
                .get(self.url(&format!("/internal/namespaces/{tenant_id}")))
                .send()
                .await?,
        )
        .await
    }

    pub async fn device_connected(&self, uid: &str) -> Result<()> {
        self.connection_stats(
            uid,
            ConnectionStats {
                connected_at: Some(Utc::now()),
                disconnected_at: None,
            },
        )
        .await
    }

    pub async fn device_disconnected(&self, uid: &str) -> Result<()> {
        self.connection_stats(
            uid,
            ConnectionStats {
                connected_at: None,
                disconnected_at: Some(Utc::now()),
            },
        )
        .await
    }

    async fn connection_stats(&self, uid: &str, stats: ConnectionStats) -> Result<()> {
        self.http
            .patch(self.url(&format!("/internal/devices/{uid}/connection-stats")))
            .json(&stats)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    /// 200 passes, 403 is a rule block, anything else is unknown; failure to
    /// reach the endpoint at all is its own error so the user can tell the
    /// difference.
    pub async fn firewall_evaluate(&self, lookup: &Lookup) -> Result<(), FirewallError> {
        let response = self
            .http
            .post(self.url("/internal/firewall/evaluate"))
            .json(lookup)
            .send()
            .await
            .map_err(|_| FirewallError::Unreachable)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::FORBIDDEN => Err(FirewallError::Blocked),
            _ => Err(FirewallError::Unknown),
        }
    }

    /// A connection is billable if the namespace can still connect, or if
    /// billing answers 402 (the namespace is past due but connections stay
    /// up while the grace policy is argued elsewhere).
    pub async fn billing_evaluate(&self, tenant_id: &str) -> Result<bool> {
        let response = self
            .http
            .post(self.url("/internal/billing/evaluate"))
            .json(&serde_json::json!({ "tenant_id": tenant_id }))
            .send()
            .await?;

        if response.status() == StatusCode::PAYMENT_REQUIRED {
            return Ok(true);
        }

        let evaluation: BillingEvaluation = parse(response).await?;

        Ok(evaluation.can_connect)
    }

    pub async fn register_session(&self, session: &SessionRecord) -> Result<()> {
        self.http
            .post(self.url("/internal/sessions"))
            .json(session)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    pub async fn session_authenticated(&self, uid: Uuid) -> Result<()> {
        self.http
            .patch(self.url(&format!("/internal/sessions/{uid}")))
            .json(&serde_json::json!({ "authenticated": true }))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    pub async fn keepalive_session(&self, uid: Uuid) -> Result<()> {
        self.http
            .post(self.url(&format!("/internal/sessions/{uid}/keepalive")))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    pub async fn finish_session(&self, uid: Uuid) -> Result<()> {
        self.http
            .post(self.url(&format!("/internal/sessions/{uid}/finish")))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    /// Fetch a registered public key record; `None` when the fingerprint is
    /// unknown for the tenant.
    pub async fn public_key(&self, fingerprint: &str, tenant_id: &str) -> Result<Option<PublicKey>> {
        let response = self
            .http
            .get(self.url(&format!("/internal/public-keys/{fingerprint}/{tenant_id}")))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(parse(response).await?))
    }

    pub async fn evaluate_key(
        &self,
        fingerprint: &str,
        device: &Device,
        username: &str,
    ) -> Result<bool> {
        let evaluation: Evaluation = parse(
            self.http
                .post(self.url(&format!("/internal/public-keys/{fingerprint}/evaluate")))
                .json(&EvaluateKey {
                    device_uid: &device.uid,
                    username,
                })
                .send()
                .await?,
        )
        .await?;

        Ok(evaluation.allowed)
    }

    /// Gateway-held private key material, for deployments that manage the
    /// magic key centrally instead of minting one per process.
    pub async fn key(&self) -> Result<String> {
        let key: KeyResponse = parse(self.http.post(self.url("/internal/key")).send().await?).await?;

        Ok(key.data)
    }

    /// Device-side: authenticate and obtain the token used on the
    /// reverse-dial upgrade.
    pub async fn auth_device(&self, request: &AuthRequest) -> Result<AuthResponse> {
        parse(
            self.http
                .post(self.url("/api/devices/auth"))
                .json(request)
                .send()
                .await?,
        )
        .await
    }

    pub async fn auth_device_with_token(
        &self,
        request: &AuthRequest,
        token: &str,
    ) -> Result<AuthResponse> {
        parse(
            self.http
                .post(self.url("/api/devices/auth"))
                .bearer_auth(token)
                .json(request)
                .send()
                .await?,
        )
        .await
    }
}

/// Agent versions gate a couple of behaviors (public-key support, exec
/// channel close). Development builds report `latest`, which compares as
/// newest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::str::FromStr for Version {
    type Err = eyre::Report;

    fn from_str(version: &str) -> Result<Self> {
        if version == "latest" {
            return Ok(Self::new(u64::MAX, u64::MAX, u64::MAX));
        }

        let mut parts = version.trim_start_matches('v').splitn(3, '.');

        let mut next = || -> Result<u64> {
            let part = parts.next().ok_or_else(|| eyre!("expected <major>.<minor>.<patch>"))?;

            // Pre-release tags ("0.9.3-rc1") only matter up to the patch
            // number here.
            let digits = part.split_once('-').map_or(part, |(number, _)| number);

            Ok(digits.parse()?)
        };

        Ok(Self::new(next()?, next()?, next()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_parse_and_order() {
        let old: Version = "0.8.1".parse().unwrap();
        let gate = Version::new(0, 9, 3);

        assert!(old < gate);
        assert!("0.9.3".parse::<Version>().unwrap() >= gate);
        assert!("v1.0.0".parse::<Version>().unwrap() > gate);
        assert!("latest".parse::<Version>().unwrap() > gate);
        assert!("0.9.3-rc1".parse::<Version>().unwrap() >= gate);
    }

    #[test]
    fn malformed_versions_are_errors_not_zero() {
        assert!("".parse::<Version>().is_err());
        assert!("0.9".parse::<Version>().is_err());
        assert!("a.b.c".parse::<Version>().is_err());
    }

    #[tokio::test]
    async fn billing_passes_on_402_or_can_connect() {
        use warp::Filter;

        let evaluate = warp::post()
            .and(warp::path!("internal" / "billing" / "evaluate"))
            .and(warp::body::json())
            .map(|body: serde_json::Value| {
                match body["tenant_id"].as_str() {
                    Some("past-due") => warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({})),
                        warp::http::StatusCode::PAYMENT_REQUIRED,
                    ),
                    Some("blocked") => warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({"can_connect": false})),
                        warp::http::StatusCode::OK,
                    ),
                    _ => warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({"can_connect": true})),
                        warp::http::StatusCode::OK,
                    ),
                }
            });

        let (addr, server) = warp::serve(evaluate).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = Client::new(format!("http://{addr}"));

        assert!(client.billing_evaluate("ok").await.unwrap());
        assert!(client.billing_evaluate("past-due").await.unwrap());
        assert!(!client.billing_evaluate("blocked").await.unwrap());
    }

    #[tokio::test]
    async fn firewall_maps_status_codes() {
        use warp::Filter;

        let evaluate = warp::post()
            .and(warp::path!("internal" / "firewall" / "evaluate"))
            .and(warp::body::json())
            .map(|body: Lookup| match body.username.as_str() {
                "blocked" => warp::http::StatusCode::FORBIDDEN,
                "broken" => warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                _ => warp::http::StatusCode::OK,
            });

        let (addr, server) = warp::serve(evaluate).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = Client::new(format!("http://{addr}"));

        let lookup = |username: &str| Lookup {
            domain: "acme".to_string(),
            name: "dev-01".to_string(),
            username: username.to_string(),
            ip_address: "10.0.0.1".to_string(),
        };

        assert!(client.firewall_evaluate(&lookup("root")).await.is_ok());
        assert!(matches!(
            client.firewall_evaluate(&lookup("blocked")).await,
            Err(FirewallError::Blocked)
        ));
        assert!(matches!(
            client.firewall_evaluate(&lookup("broken")).await,
            Err(FirewallError::Unknown)
        ));

        let unreachable = Client::new("http://127.0.0.1:9".to_string());
        assert!(matches!(
            unreachable.firewall_evaluate(&lookup("root")).await,
            Err(FirewallError::Unreachable)
        ));
    }
}
