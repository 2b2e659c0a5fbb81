//! Reverse-proxy routes as Traefik file-provider documents, one file per
//! `(hostname, external port)`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use zlh_model::Transport;

use super::{EdgeError, EdgeResult, Route, RouteWriter};
use crate::config::env_string;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Router {
    entry_points: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule: Option<String>,
    service: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Server {
    address: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Service {
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Section {
    routers: BTreeMap<String, Router>,
    services: BTreeMap<String, Service>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Default)]
struct DynamicConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    tcp: Option<Section>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udp: Option<Section>,
}

fn entry_point(route: &Route) -> String {
    format!("{}-{}", route.transport.as_str(), route.external_port)
}

fn document(route: &Route) -> DynamicConfig {
    let name = format!("{}-{}", route.hostname, route.external_port);
    let rule = match route.transport {
        Transport::Tcp => Some("HostSNI(`*`)".to_string()),
        Transport::Udp => None,
    };
    let section = Section {
        routers: BTreeMap::from([(
            name.clone(),
            Router {
                entry_points: vec![entry_point(route)],
                rule,
                service: name.clone(),
            },
        )]),
        services: BTreeMap::from([(
            name,
            Service {
                load_balancer: LoadBalancer {
                    servers: vec![Server {
                        address: format!("{}:{}", route.backend_address, route.backend_port),
                    }],
                },
            },
        )]),
    };
    match route.transport {
        Transport::Tcp => DynamicConfig {
            tcp: Some(section),
            udp: None,
        },
        Transport::Udp => DynamicConfig {
            tcp: None,
            udp: Some(section),
        },
    }
}

/// `<hostname>-<digits>.yml`
fn is_route_file(file_name: &str, hostname: &str) -> bool {
    file_name
        .strip_prefix(hostname)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.strip_suffix(".yml"))
        .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

pub struct TraefikRoutes {
    dir: PathBuf,
}

impl TraefikRoutes {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_env() -> Self {
        Self::new(env_string("TRAEFIK_DYNAMIC_DIR").unwrap_or_else(|| "/etc/traefik/dynamic".to_string()))
    }

    fn path_for(&self, route: &Route) -> PathBuf {
        self.dir
            .join(format!("{}-{}.yml", route.hostname, route.external_port))
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> EdgeResult<()> {
    let tmp = path.with_extension("yml.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|source| EdgeError::Io {
            op: "write route",
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| EdgeError::Io {
            op: "rename route",
            source,
        })
}

#[async_trait::async_trait]
impl RouteWriter for TraefikRoutes {
    async fn write_route(&self, route: &Route) -> EdgeResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| EdgeError::Io {
                op: "create route dir",
                source,
            })?;
        let yaml = serde_yaml::to_string(&document(route))?;
        let path = self.path_for(route);
        write_atomic(&path, yaml.as_bytes()).await?;
        tracing::info!(
            path = %path.display(),
            entry_point = %entry_point(route),
            backend = %format!("{}:{}", route.backend_address, route.backend_port),
            "route written"
        );
        Ok(())
    }

    async fn remove_routes(&self, hostname: &str) -> EdgeResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(EdgeError::Io {
                    op: "list routes",
                    source,
                });
            }
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| EdgeError::Io {
                op: "list routes",
                source,
            })?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_route_file(name, hostname) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(EdgeError::Io {
                        op: "remove route",
                        source,
                    });
                }
            }
        }
        if removed > 0 {
            tracing::info!(hostname, removed, "routes removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(port: u16, transport: Transport) -> Route {
        Route {
            hostname: "terraria-5004".into(),
            external_port: port,
            backend_address: "10.200.0.9".into(),
            backend_port: 7777,
            transport,
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("zlh-traefik-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn tcp_document_shape() {
        let yaml = serde_yaml::to_string(&document(&route(50000, Transport::Tcp))).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let router = &parsed["tcp"]["routers"]["terraria-5004-50000"];
        assert_eq!(router["entryPoints"][0], "tcp-50000");
        assert_eq!(router["rule"], "HostSNI(`*`)");
        assert_eq!(
            parsed["tcp"]["services"]["terraria-5004-50000"]["loadBalancer"]["servers"][0]["address"],
            "10.200.0.9:7777"
        );
        assert!(parsed.get("udp").is_none());
    }

    #[test]
    fn udp_router_has_no_rule() {
        let doc = document(&route(50001, Transport::Udp));
        let section = doc.udp.unwrap();
        let router = &section.routers["terraria-5004-50001"];
        assert_eq!(router.entry_points, vec!["udp-50001".to_string()]);
        assert!(router.rule.is_none());
    }

    #[test]
    fn route_file_matching_is_exact() {
        assert!(is_route_file("terraria-5004-50000.yml", "terraria-5004"));
        assert!(!is_route_file("terraria-50040-50000.yml", "terraria-5004"));
        assert!(!is_route_file("terraria-5004-abc.yml", "terraria-5004"));
        assert!(!is_route_file("terraria-5004-50000.yml.tmp", "terraria-5004"));
    }

    #[tokio::test]
    async fn write_then_remove_all_for_host() {
        let dir = scratch_dir();
        let routes = TraefikRoutes::new(&dir);
        routes.write_route(&route(50000, Transport::Tcp)).await.unwrap();
        routes.write_route(&route(50001, Transport::Udp)).await.unwrap();
        let mut other = route(50002, Transport::Tcp);
        other.hostname = "valheim-5005".into();
        routes.write_route(&other).await.unwrap();

        assert_eq!(routes.remove_routes("terraria-5004").await.unwrap(), 2);
        assert_eq!(routes.remove_routes("terraria-5004").await.unwrap(), 0);
        assert!(dir.join("valheim-5005-50002.yml").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_directory_removes_nothing() {
        let routes = TraefikRoutes::new(scratch_dir());
        assert_eq!(routes.remove_routes("anything").await.unwrap(), 0);
    }
}
