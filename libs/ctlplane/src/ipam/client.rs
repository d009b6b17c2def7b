use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use ctlplane_bootstrap::IpamConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Ipam, IpamError};

const SERVICE_PATH: &str = "api.v1.IpamService";

/// JSON client for a connect-RPC IPAM service.
#[derive(Debug, Clone)]
pub struct IpamClient {
    base: Url,
    namespace: Option<String>,
    http: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePrefixRequest<'a> {
    cidr: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcquireIpRequest<'a> {
    prefix_cidr: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseIpRequest<'a> {
    prefix_cidr: &'a str,
    ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Deserialize)]
struct PrefixResponse {
    prefix: Option<Prefix>,
}

#[derive(Deserialize)]
struct Prefix {
    #[allow(dead_code)]
    cidr: String,
}

#[derive(Deserialize)]
struct IpResponse {
    ip: Option<Ip>,
}

#[derive(Deserialize)]
struct Ip {
    ip: String,
}

/// Error body of a failed connect-RPC call.
#[derive(Deserialize)]
struct RpcStatus {
    code: String,
    #[serde(default)]
    message: String,
}

impl IpamClient {
    pub const DEFAULT_URL: &'static str = "http://127.0.0.1:9090";

    pub fn new(cfg: &IpamConfig) -> Result<Self, IpamError> {
        let base = Url::parse(&cfg.url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            base,
            namespace: cfg.namespace.clone(),
            http,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/{SERVICE_PATH}/{method}",
            self.base.as_str().trim_end_matches('/')
        )
    }

    async fn call<Req, Resp>(&self, method: &str, req: &Req) -> Result<Resp, IpamError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let resp = self
            .http
            .post(self.endpoint(method))
            .header("Connect-Protocol-Version", "1")
            .json(req)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<Resp>().await?);
        }

        let body = resp.text().await?;
        tracing::debug!(method, %status, "IPAM call failed");
        Err(match serde_json::from_str::<RpcStatus>(&body) {
            Ok(rpc) => IpamError::Rpc {
                code: rpc.code,
                message: rpc.message,
            },
            Err(_) => IpamError::Rpc {
                code: status.as_str().to_string(),
                message: body,
            },
        })
    }
}

#[async_trait]
impl Ipam for IpamClient {
    async fn create_prefix(&self, cidr: &str) -> Result<(), IpamError> {
        let req = CreatePrefixRequest {
            cidr,
            namespace: self.namespace.as_deref(),
        };
        let resp: PrefixResponse = self.call("CreatePrefix", &req).await?;
        resp.prefix
            .map(|_| ())
            .ok_or_else(|| IpamError::InvalidResponse("CreatePrefix returned no prefix".into()))
    }

    async fn acquire_ip(&self, prefix_cidr: &str, ip: Option<IpAddr>) -> Result<IpAddr, IpamError> {
        let req = AcquireIpRequest {
            prefix_cidr,
            ip: ip.map(|ip| ip.to_string()),
            namespace: self.namespace.as_deref(),
        };
        let resp: IpResponse = self.call("AcquireIP", &req).await?;
        let ip = resp
            .ip
            .ok_or_else(|| IpamError::InvalidResponse("AcquireIP returned no ip".into()))?;
        ip.ip
            .parse()
            .map_err(|_| IpamError::InvalidResponse(format!("malformed address `{}`", ip.ip)))
    }

    async fn release_ip(&self, prefix_cidr: &str, ip: IpAddr) -> Result<(), IpamError> {
        let req = ReleaseIpRequest {
            prefix_cidr,
            ip: ip.to_string(),
            namespace: self.namespace.as_deref(),
        };
        let _: IpResponse = self.call("ReleaseIP", &req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer, namespace: Option<&str>) -> IpamClient {
        IpamClient::new(&IpamConfig {
            url: server.base_url(),
            namespace: namespace.map(str::to_owned),
            timeout_ms: 2_000,
        })
        .unwrap()
    }

    #[test]
    fn rejects_malformed_url() {
        let err = IpamClient::new(&IpamConfig {
            url: "not a url".into(),
            namespace: None,
            timeout_ms: 1_000,
        })
        .unwrap_err();
        assert!(matches!(err, IpamError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn create_prefix_posts_cidr_and_namespace() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api.v1.IpamService/CreatePrefix")
                    .json_body(json!({ "cidr": "100.64.0.0/10", "namespace": "org-1" }));
                then.status(200)
                    .json_body(json!({ "prefix": { "cidr": "100.64.0.0/10" } }));
            })
            .await;

        client_for(&server, Some("org-1"))
            .create_prefix("100.64.0.0/10")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn acquire_returns_allocated_address() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api.v1.IpamService/AcquireIP")
                    .json_body(json!({ "prefixCidr": "100.64.0.0/10" }));
                then.status(200)
                    .json_body(json!({ "ip": { "ip": "100.64.0.1", "prefixCidr": "100.64.0.0/10" } }));
            })
            .await;

        let ip = client_for(&server, None)
            .acquire_ip("100.64.0.0/10", None)
            .await
            .unwrap();
        assert_eq!(ip, "100.64.0.1".parse::<IpAddr>().unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn acquire_specific_address() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api.v1.IpamService/AcquireIP")
                    .json_body(json!({ "prefixCidr": "10.0.0.0/24", "ip": "10.0.0.7" }));
                then.status(200)
                    .json_body(json!({ "ip": { "ip": "10.0.0.7", "prefixCidr": "10.0.0.0/24" } }));
            })
            .await;

        let wanted: IpAddr = "10.0.0.7".parse().unwrap();
        let ip = client_for(&server, None)
            .acquire_ip("10.0.0.0/24", Some(wanted))
            .await
            .unwrap();
        assert_eq!(ip, wanted);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rpc_error_body_is_decoded() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api.v1.IpamService/ReleaseIP");
                then.status(404)
                    .json_body(json!({ "code": "not_found", "message": "ip not allocated" }));
            })
            .await;

        let err = client_for(&server, None)
            .release_ip("10.0.0.0/24", "10.0.0.9".parse().unwrap())
            .await
            .unwrap_err();
        match err {
            IpamError::Rpc { code, message } => {
                assert_eq!(code, "not_found");
                assert_eq!(message, "ip not allocated");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_error_keeps_status_and_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api.v1.IpamService/CreatePrefix");
                then.status(502).body("bad gateway");
            })
            .await;

        let err = client_for(&server, None)
            .create_prefix("10.0.0.0/24")
            .await
            .unwrap_err();
        match err {
            IpamError::Rpc { code, message } => {
                assert_eq!(code, "502");
                assert_eq!(message, "bad gateway");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_error_body_is_a_transport_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\ncontent-type: text/plain\r\ncontent-length: 64\r\n\r\ntrunc",
            )
            .await
            .unwrap();
        });

        let client = IpamClient::new(&IpamConfig {
            url: format!("http://{addr}"),
            namespace: None,
            timeout_ms: 2_000,
        })
        .unwrap();
        let err = client.create_prefix("10.0.0.0/24").await.unwrap_err();
        assert!(matches!(err, IpamError::Transport(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_address_in_response_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api.v1.IpamService/AcquireIP");
                then.status(200).json_body(json!({}));
            })
            .await;

        let err = client_for(&server, None)
            .acquire_ip("10.0.0.0/24", None)
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::InvalidResponse(_)));
    }
}
