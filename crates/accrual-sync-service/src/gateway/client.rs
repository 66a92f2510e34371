//! 积分计算服务 HTTP 客户端
//!
//! `GET {base_url}/api/orders/{number}`：
//! - 200：`{"order": "...", "status": "REGISTERED|INVALID|PROCESSING|PROCESSED", "accrual": 500}`
//! - 204：订单未登记
//! - 429：限流，可能携带 `Retry-After`
//! - 500：服务内部错误

use std::time::{Duration, Instant};

use async_trait::async_trait;
use loyalty_shared::config::AccrualConfig;
use loyalty_shared::error::LoyaltyError;
use loyalty_shared::observability::metrics;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{AccrualGateway, LookupOutcome, RemoteStatus};
use crate::error::Result;
use crate::models::OrderStatus;
use crate::models::money::normalize_amount;

/// 200 响应体
#[derive(Debug, Deserialize)]
struct AccrualResponse {
    order: String,
    status: String,
    #[serde(default)]
    accrual: Option<serde_json::Number>,
}

/// 积分计算服务客户端
///
/// reqwest::Client 内部带连接池，clone 是廉价操作。
#[derive(Clone)]
pub struct AccrualClient {
    http: reqwest::Client,
    base_url: String,
}

impl AccrualClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoyaltyError::ExternalService {
                service: "accrual".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &AccrualConfig) -> Result<Self> {
        Self::new(&config.base_url, config.request_timeout())
    }

    fn order_url(&self, order_number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_number)
    }

    async fn fetch(&self, order_number: &str) -> LookupOutcome {
        let response = match self.http.get(self.order_url(order_number)).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(order_number, error = %e, timeout = e.is_timeout(), "积分服务请求失败");
                return LookupOutcome::ExternalUnavailable;
            }
        };

        match response.status() {
            StatusCode::OK => {
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(order_number, error = %e, "读取积分服务响应失败");
                        return LookupOutcome::ExternalUnavailable;
                    }
                };
                decode_resolved(order_number, &body)
            }
            StatusCode::NO_CONTENT => LookupOutcome::NotYetRegistered,
            StatusCode::TOO_MANY_REQUESTS => LookupOutcome::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            },
            StatusCode::INTERNAL_SERVER_ERROR => LookupOutcome::ExternalUnavailable,
            other => LookupOutcome::ProtocolError {
                detail: format!("unexpected status {}", other.as_u16()),
            },
        }
    }
}

#[async_trait]
impl AccrualGateway for AccrualClient {
    #[instrument(skip(self))]
    async fn lookup(&self, order_number: &str) -> LookupOutcome {
        let start = Instant::now();
        let outcome = self.fetch(order_number).await;
        metrics::record_accrual_lookup(outcome.label(), start.elapsed().as_secs_f64());
        debug!(outcome = outcome.label(), "积分服务查询完成");
        outcome
    }
}

/// 解析 200 响应体
fn decode_resolved(order_number: &str, body: &[u8]) -> LookupOutcome {
    let parsed: AccrualResponse = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return LookupOutcome::ProtocolError {
                detail: format!("undecodable body: {}", e),
            };
        }
    };

    if parsed.order != order_number {
        return LookupOutcome::ProtocolError {
            detail: format!(
                "order number mismatch: requested {}, got {}",
                order_number, parsed.order
            ),
        };
    }

    let status = match OrderStatus::from_remote(&parsed.status) {
        Some(status) => status,
        None => {
            return LookupOutcome::Resolved {
                status: RemoteStatus::Unrecognized(parsed.status),
                accrual: None,
            };
        }
    };

    // 仅 PROCESSED 的积分有意义
    let accrual = match (status, parsed.accrual) {
        (OrderStatus::Processed, Some(number)) => match normalize_amount(&number) {
            Some(amount) if amount < Decimal::ZERO => {
                return LookupOutcome::ProtocolError {
                    detail: format!("negative accrual {}", number),
                };
            }
            Some(amount) => Some(amount),
            None => {
                return LookupOutcome::ProtocolError {
                    detail: format!("unrepresentable accrual {}", number),
                };
            }
        },
        _ => None,
    };

    LookupOutcome::Resolved {
        status: RemoteStatus::Known(status),
        accrual,
    }
}

/// `Retry-After` 仅支持秒数格式，无法解析时返回 None
fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        extract::Path,
        http::{StatusCode as AxumStatus, header},
        response::IntoResponse,
        routing::get,
    };

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: &str) -> AccrualClient {
        AccrualClient::new(base_url, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_decode_processed_with_rounding() {
        let body = br#"{"order":"79927398713","status":"PROCESSED","accrual":12.345}"#;
        assert_eq!(
            decode_resolved("79927398713", body),
            LookupOutcome::Resolved {
                status: RemoteStatus::Known(OrderStatus::Processed),
                accrual: Some(Decimal::new(1235, 2)),
            }
        );
    }

    #[test]
    fn test_decode_registered_maps_to_new_and_drops_accrual() {
        let body = br#"{"order":"79927398713","status":"REGISTERED","accrual":10}"#;
        assert_eq!(
            decode_resolved("79927398713", body),
            LookupOutcome::Resolved {
                status: RemoteStatus::Known(OrderStatus::New),
                accrual: None,
            }
        );
    }

    #[test]
    fn test_decode_unrecognized_status() {
        let body = br#"{"order":"79927398713","status":"ARCHIVED"}"#;
        assert_eq!(
            decode_resolved("79927398713", body),
            LookupOutcome::Resolved {
                status: RemoteStatus::Unrecognized("ARCHIVED".to_string()),
                accrual: None,
            }
        );
    }

    #[test]
    fn test_decode_protocol_errors() {
        let mismatch = br#"{"order":"1","status":"PROCESSED","accrual":1}"#;
        assert!(matches!(
            decode_resolved("79927398713", mismatch),
            LookupOutcome::ProtocolError { .. }
        ));

        let negative = br#"{"order":"79927398713","status":"PROCESSED","accrual":-5}"#;
        assert!(matches!(
            decode_resolved("79927398713", negative),
            LookupOutcome::ProtocolError { .. }
        ));

        assert!(matches!(
            decode_resolved("79927398713", b"not json"),
            LookupOutcome::ProtocolError { .. }
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, "60".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(60));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_lookup_processed() {
        let router = Router::new().route(
            "/api/orders/{number}",
            get(|Path(number): Path<String>| async move {
                axum::Json(serde_json::json!({
                    "order": number,
                    "status": "PROCESSED",
                    "accrual": 500
                }))
            }),
        );
        let base = spawn_server(router).await;

        let outcome = client(&base).lookup("4561261212345467").await;
        assert_eq!(
            outcome,
            LookupOutcome::Resolved {
                status: RemoteStatus::Known(OrderStatus::Processed),
                accrual: Some(Decimal::new(50000, 2)),
            }
        );
    }

    #[tokio::test]
    async fn test_lookup_status_code_mapping() {
        let router = Router::new()
            .route(
                "/api/orders/204",
                get(|| async { AxumStatus::NO_CONTENT.into_response() }),
            )
            .route(
                "/api/orders/429",
                get(|| async {
                    (AxumStatus::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "60")]).into_response()
                }),
            )
            .route(
                "/api/orders/500",
                get(|| async { AxumStatus::INTERNAL_SERVER_ERROR.into_response() }),
            )
            .route(
                "/api/orders/418",
                get(|| async { AxumStatus::IM_A_TEAPOT.into_response() }),
            );
        let base = spawn_server(router).await;
        let client = client(&base);

        assert_eq!(client.lookup("204").await, LookupOutcome::NotYetRegistered);
        assert_eq!(
            client.lookup("429").await,
            LookupOutcome::RateLimited {
                retry_after: Some(60)
            }
        );
        assert_eq!(client.lookup("500").await, LookupOutcome::ExternalUnavailable);
        assert!(matches!(
            client.lookup("418").await,
            LookupOutcome::ProtocolError { .. }
        ));
    }

    #[tokio::test]
    async fn test_lookup_timeout_is_unavailable() {
        let router = Router::new().route(
            "/api/orders/{number}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                AxumStatus::NO_CONTENT
            }),
        );
        let base = spawn_server(router).await;
        let client = AccrualClient::new(&base, Duration::from_millis(100)).unwrap();

        assert_eq!(
            client.lookup("79927398713").await,
            LookupOutcome::ExternalUnavailable
        );
    }

    #[tokio::test]
    async fn test_lookup_connection_refused_is_unavailable() {
        // 绑定后立即释放端口，确保无人监听
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(&format!("http://{}", addr));
        assert_eq!(
            client.lookup("79927398713").await,
            LookupOutcome::ExternalUnavailable
        );
    }
}
