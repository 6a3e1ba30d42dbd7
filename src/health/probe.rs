use super::readiness::{self, describe_request_error};
use crate::config::{Profile, ServiceId};
use crate::datastore::{self, SqlRunner};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpExpect {
    /// Body must be a readiness document whose own status is serving.
    ReadinessDocument,
    /// Any 2xx/3xx response.
    AnySuccess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessTarget {
    pub host: String,
    pub port: u16,
}

/// How a service's health is observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    /// Connectivity, database identity and expected schema objects, as one step.
    Datastore {
        expected_db: String,
        expected_tables: Vec<String>,
    },
    HttpEndpoint { url: String, expect: HttpExpect },
    /// Only visible as `dependencies.<key>` inside `host`'s readiness document.
    DependentFlag {
        host: ServiceId,
        url: String,
        key: String,
        fallback: LivenessTarget,
    },
    LivenessOnly(LivenessTarget),
}

impl CheckKind {
    pub fn describe(&self) -> String {
        match self {
            CheckKind::Datastore { expected_db, .. } => format!("database {expected_db}"),
            CheckKind::HttpEndpoint { url, .. } => url.clone(),
            CheckKind::DependentFlag { host, key, .. } => format!("{key} flag in {host} readiness"),
            CheckKind::LivenessOnly(t) => format!("tcp {}:{}", t.host, t.port),
        }
    }
}

/// The check each in-profile service gets. Out-of-profile services get none.
pub fn check_for(profile: &Profile, id: ServiceId) -> Option<CheckKind> {
    if !profile.includes(id) {
        return None;
    }
    let port = profile.port(id)?;
    let kind = match id {
        ServiceId::Db => CheckKind::Datastore {
            expected_db: profile.db.name.clone(),
            expected_tables: profile.expected_tables(),
        },
        ServiceId::Api => CheckKind::HttpEndpoint {
            url: api_readiness_url(profile)?,
            expect: HttpExpect::ReadinessDocument,
        },
        ServiceId::Cache => CheckKind::DependentFlag {
            host: ServiceId::Api,
            url: api_readiness_url(profile)?,
            key: "cache".to_string(),
            fallback: LivenessTarget {
                host: "127.0.0.1".to_string(),
                port,
            },
        },
        ServiceId::Ui => CheckKind::HttpEndpoint {
            url: format!("http://localhost:{port}{}", profile.ui_health_path()),
            expect: HttpExpect::AnySuccess,
        },
    };
    Some(kind)
}

fn api_readiness_url(profile: &Profile) -> Option<String> {
    let port = profile.port(ServiceId::Api)?;
    Some(format!("http://localhost:{port}{}", profile.api_health_path()))
}

/// One check attempt. `Err` carries the reason the service is not (yet) healthy.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn attempt(&self, service: ServiceId, kind: &CheckKind) -> Result<(), String>;
}

pub struct LiveProbe {
    http: reqwest::Client,
    sql: Box<dyn SqlRunner>,
    attempt_timeout: Duration,
}

impl LiveProbe {
    pub fn new(sql: Box<dyn SqlRunner>, attempt_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .connect_timeout(attempt_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            sql,
            attempt_timeout,
        })
    }

    async fn http_any_success(&self, url: &str) -> Result<(), String> {
        let resp = self.http.get(url).send().await.map_err(describe_request_error)?;
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(format!("HTTP {status}"))
        }
    }

    async fn tcp_connect(&self, target: &LivenessTarget) -> Result<(), String> {
        match timeout(self.attempt_timeout, TcpStream::connect((target.host.as_str(), target.port))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(format!("tcp {}:{}: {e}", target.host, target.port)),
            Err(_) => Err(format!("tcp {}:{} timed out", target.host, target.port)),
        }
    }
}

#[async_trait]
impl Probe for LiveProbe {
    async fn attempt(&self, _service: ServiceId, kind: &CheckKind) -> Result<(), String> {
        match kind {
            CheckKind::Datastore {
                expected_db,
                expected_tables,
            } => {
                let sql = datastore::identity_check_sql(expected_tables);
                let out = self.sql.query(&sql).await.map_err(|e| format!("{e:#}"))?;
                datastore::evaluate_identity(&out, expected_db, datastore::table_refs(expected_tables).len())
            }
            CheckKind::HttpEndpoint {
                url,
                expect: HttpExpect::ReadinessDocument,
            } => readiness::fetch(&self.http, url).await?.api_serving(),
            CheckKind::HttpEndpoint {
                url,
                expect: HttpExpect::AnySuccess,
            } => self.http_any_success(url).await,
            CheckKind::DependentFlag { url, key, .. } => readiness::fetch(&self.http, url).await?.dependency(key),
            CheckKind::LivenessOnly(target) => self.tcp_connect(target).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_profile, ProfileName};
    use httpmock::prelude::*;
    use serde_json::json;

    struct NoSql;

    #[async_trait]
    impl SqlRunner for NoSql {
        async fn query(&self, _sql: &str) -> anyhow::Result<String> {
            anyhow::bail!("no datastore in this test")
        }
    }

    fn probe() -> LiveProbe {
        LiveProbe::new(Box::new(NoSql), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn minimal_profile_has_no_cache_or_ui_checks() {
        let p = test_profile(ProfileName::Minimal, &[]);
        assert!(check_for(&p, ServiceId::Cache).is_none());
        assert!(check_for(&p, ServiceId::Ui).is_none());
        assert!(matches!(check_for(&p, ServiceId::Db), Some(CheckKind::Datastore { .. })));
    }

    #[test]
    fn cache_is_a_dependent_flag_on_the_api() {
        let p = test_profile(ProfileName::Full, &[]);
        match check_for(&p, ServiceId::Cache) {
            Some(CheckKind::DependentFlag { host, url, key, fallback }) => {
                assert_eq!(host, ServiceId::Api);
                assert_eq!(url, "http://localhost:8080/health/ready");
                assert_eq!(key, "cache");
                assert_eq!(fallback.port, 6379);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_and_cache_read_the_same_document() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(GET).path("/health/ready");
            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(json!({"status": "degraded", "dependencies": {"database": "ok", "cache": "error"}}));
        }).await;
        let url = server.url("/health/ready");
        let p = probe();

        let api = CheckKind::HttpEndpoint {
            url: url.clone(),
            expect: HttpExpect::ReadinessDocument,
        };
        assert!(p.attempt(ServiceId::Api, &api).await.is_ok());

        let cache = CheckKind::DependentFlag {
            host: ServiceId::Api,
            url,
            key: "cache".into(),
            fallback: LivenessTarget {
                host: "127.0.0.1".into(),
                port: 1,
            },
        };
        assert_eq!(p.attempt(ServiceId::Cache, &cache).await.unwrap_err(), "cache=error");
    }

    #[tokio::test]
    async fn ui_redirect_counts_as_up() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(302).header("Location", "/login");
        }).await;
        let kind = CheckKind::HttpEndpoint {
            url: server.url("/"),
            expect: HttpExpect::AnySuccess,
        };
        assert!(probe().attempt(ServiceId::Ui, &kind).await.is_ok());
    }

    #[tokio::test]
    async fn refused_connection_is_not_ready_yet() {
        let port = {
            let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let kind = CheckKind::HttpEndpoint {
            url: format!("http://127.0.0.1:{port}/health/ready"),
            expect: HttpExpect::ReadinessDocument,
        };
        assert!(probe().attempt(ServiceId::Api, &kind).await.is_err());
    }

    #[tokio::test]
    async fn liveness_connects_to_listener() {
        let l = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let kind = CheckKind::LivenessOnly(LivenessTarget {
            host: "127.0.0.1".into(),
            port: l.local_addr().unwrap().port(),
        });
        assert!(probe().attempt(ServiceId::Cache, &kind).await.is_ok());
    }
}
