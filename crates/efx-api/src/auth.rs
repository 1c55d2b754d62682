//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Account login and MQTT credential acquisition.
//!
//! Bus transports cannot connect with the account email/password
//! directly. A two-step HTTP exchange trades them for broker
//! credentials: a login call yields a bearer token and user id, then a
//! certification call yields broker host, port, and a per-account
//! certificate login.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ApiError;

const LOGIN_PATH: &str = "/auth/login";
const CERTIFICATION_PATH: &str = "/iot-auth/app/certification";

/// Everything needed to open an MQTT session against the vendor broker.
#[derive(Debug, Clone)]
pub struct MqttCredentials {
    /// Account user id; part of topic names and the client id.
    pub user_id: String,
    /// Broker hostname.
    pub broker_host: String,
    /// Broker TLS port.
    pub broker_port: u16,
    /// Broker username.
    pub certificate_account: String,
    /// Broker password.
    pub certificate_password: String,
}

impl MqttCredentials {
    /// Client id in the form the broker's ACL expects. A fresh UUID per
    /// session avoids takeover when several exporters share an account.
    pub fn client_id(&self) -> String {
        format!(
            "ANDROID_{}_{}",
            Uuid::new_v4().to_string().to_uppercase(),
            self.user_id
        )
    }
}

/// Performs the login + certification exchange.
#[derive(Debug, Clone)]
pub struct MqttAuthentication {
    user: String,
    password: String,
    base_url: String,
}

#[derive(Deserialize)]
struct AuthEnvelope<T> {
    #[serde(default)]
    code: serde_json::Value,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
struct LoginData {
    token: String,
    user: LoginUser,
}

#[derive(Deserialize)]
struct LoginUser {
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Deserialize)]
struct CertificationData {
    url: String,
    port: serde_json::Value,
    #[serde(rename = "certificateAccount")]
    certificate_account: String,
    #[serde(rename = "certificatePassword")]
    certificate_password: String,
}

impl MqttAuthentication {
    /// Authenticator for the given account against a vendor API host.
    pub fn new(user: String, password: String, host: &str) -> Self {
        Self::with_base_url(user, password, format!("https://{host}"))
    }

    /// Authenticator against an explicit base URL. Used by tests to
    /// point at a local server.
    pub fn with_base_url(user: String, password: String, base_url: String) -> Self {
        Self {
            user,
            password,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Run the full login + certification exchange.
    pub async fn acquire(&self) -> Result<MqttCredentials, ApiError> {
        let http = reqwest::Client::new();

        debug!(user = %self.user, "logging in for broker credentials");
        let login_body = serde_json::json!({
            "email": self.user,
            "password": BASE64.encode(self.password.as_bytes()),
            "scene": "IOT_APP",
            "userType": "ECOFLOW",
        });
        let response = http
            .post(format!("{}{}", self.base_url, LOGIN_PATH))
            .header("lang", "en_US")
            .json(&login_body)
            .send()
            .await
            .map_err(|err| ApiError::Transient(format!("login request: {err}")))?;
        let login: AuthEnvelope<LoginData> = response
            .json()
            .await
            .map_err(|err| ApiError::Transient(format!("decoding login response: {err}")))?;
        let login_data = unwrap_envelope(login, "login")?;

        let response = http
            .get(format!("{}{}", self.base_url, CERTIFICATION_PATH))
            .query(&[("userId", login_data.user.user_id.as_str())])
            .header("lang", "en_US")
            .header("authorization", format!("Bearer {}", login_data.token))
            .send()
            .await
            .map_err(|err| ApiError::Transient(format!("certification request: {err}")))?;
        let certification: AuthEnvelope<CertificationData> =
            response.json().await.map_err(|err| {
                ApiError::Transient(format!("decoding certification response: {err}"))
            })?;
        let certification = unwrap_envelope(certification, "certification")?;

        let broker_port = parse_port(&certification.port)
            .ok_or(ApiError::MalformedResponse("certification port"))?;
        info!(
            broker_host = %certification.url,
            broker_port,
            "broker credentials acquired"
        );
        Ok(MqttCredentials {
            user_id: login_data.user.user_id,
            broker_host: certification.url,
            broker_port,
            certificate_account: certification.certificate_account,
            certificate_password: certification.certificate_password,
        })
    }
}

fn unwrap_envelope<T>(envelope: AuthEnvelope<T>, step: &str) -> Result<T, ApiError> {
    let code = match &envelope.code {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    if code != "0" {
        return Err(ApiError::Authentication(format!(
            "{step} rejected (code={code}): {}",
            envelope.message.unwrap_or_default()
        )));
    }
    envelope.data.ok_or(ApiError::MalformedResponse("data"))
}

fn parse_port(value: &serde_json::Value) -> Option<u16> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::net::SocketAddr;

    async fn spawn_mock(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn auth_for(addr: SocketAddr) -> MqttAuthentication {
        MqttAuthentication::with_base_url(
            "user@example.com".into(),
            "hunter2".into(),
            format!("http://{addr}"),
        )
    }

    #[tokio::test]
    async fn exchange_yields_broker_credentials() {
        let router = Router::new()
            .route(
                LOGIN_PATH,
                post(|Json(body): Json<serde_json::Value>| async move {
                    // The password travels base64-encoded, never in the clear.
                    assert_eq!(body["password"], BASE64.encode("hunter2"));
                    assert_eq!(body["scene"], "IOT_APP");
                    assert_eq!(body["userType"], "ECOFLOW");
                    Json(serde_json::json!({
                        "code": "0",
                        "data": {"token": "tok-123", "user": {"userId": "9876543"}}
                    }))
                }),
            )
            .route(
                CERTIFICATION_PATH,
                get(|| async {
                    Json(serde_json::json!({
                        "code": "0",
                        "data": {
                            "url": "mqtt.ecoflow.com",
                            "port": "8883",
                            "protocol": "mqtts",
                            "certificateAccount": "open-abc",
                            "certificatePassword": "s3cret"
                        }
                    }))
                }),
            );
        let addr = spawn_mock(router).await;

        let creds = auth_for(addr).acquire().await.unwrap();
        assert_eq!(creds.user_id, "9876543");
        assert_eq!(creds.broker_host, "mqtt.ecoflow.com");
        assert_eq!(creds.broker_port, 8883);
        assert_eq!(creds.certificate_account, "open-abc");

        let client_id = creds.client_id();
        assert!(client_id.starts_with("ANDROID_"));
        assert!(client_id.ends_with("_9876543"));
    }

    #[tokio::test]
    async fn rejected_login_is_an_authentication_error() {
        let router = Router::new().route(
            LOGIN_PATH,
            post(|| async {
                Json(serde_json::json!({"code": "1001", "message": "password error"}))
            }),
        );
        let addr = spawn_mock(router).await;

        match auth_for(addr).acquire().await {
            Err(ApiError::Authentication(msg)) => {
                assert!(msg.contains("1001"));
                assert!(msg.contains("password error"));
            }
            other => panic!("expected authentication error, got {other:?}"),
        }
    }
}
