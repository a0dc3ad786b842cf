use crate::context::DeploymentContext;
use crate::engine::{connect_engine, ContainerResolver, LocalFiles, TunnelTransport};
use crate::error::IslectlError;
use crate::ssh::RemoteSession;
use serde::Serialize;

const DB_VARS: [&str; 4] = ["DB_ROOT_USER", "DB_ROOT_PASSWORD", "DB_MYSQL_HOST", "DB_MYSQL_PORT"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatabaseUris {
    pub database_uri: String,
    pub tunnel_params: String,
}

impl DatabaseUris {
    /// The form database GUIs accept: `<database_uri>?<tunnel_params>`.
    pub fn combined(&self) -> String {
        format!("{}?{}", self.database_uri, self.tunnel_params)
    }
}

pub fn build_database_uris(ctx: &DeploymentContext) -> Result<DatabaseUris, IslectlError> {
    if ctx.is_remote() {
        let session = RemoteSession::open(ctx)?;
        let engine = TunnelTransport::new(&session, &ctx.docker_socket);
        let resolver = ContainerResolver::new(ctx, &engine, &session);
        database_uris_with(ctx, &resolver)
    } else {
        let engine = connect_engine(ctx, None)?;
        let resolver = ContainerResolver::new(ctx, engine.as_ref(), &LocalFiles);
        database_uris_with(ctx, &resolver)
    }
}

pub fn database_uris_with(
    ctx: &DeploymentContext,
    resolver: &ContainerResolver<'_>,
) -> Result<DatabaseUris, IslectlError> {
    let mariadb = resolver.resolve_container("mariadb", false)?;
    let [user, password, host, port] =
        DB_VARS.map(|name| resolver.read_secret_or_env(&mariadb, name).trim().to_string());

    let (host, tunnel_params) = if ctx.is_remote() {
        let address = resolver.resolve_network_address(&mariadb)?;
        let params = format!(
            "ssh_host={}&ssh_port={}&ssh_user={}&ssh_keyLocation={}&ssh_keyLocationEnabled=1",
            ctx.ssh_hostname,
            ctx.ssh_port,
            ctx.ssh_user,
            ctx.ssh_key_path().display()
        );
        (address, params)
    } else {
        let ide = resolver.resolve_container("ide", true)?;
        let ide_password = resolver.read_secret_or_env(&ide, "CODE_SERVER_PASSWORD");
        let params = format!(
            "ssh_host={}&ssh_port={}&ssh_user={}&ssh_password={}",
            ctx.ssh_hostname,
            ctx.ssh_port,
            ctx.ssh_user,
            ide_password.trim()
        );
        (host, params)
    };

    Ok(DatabaseUris {
        database_uri: format!(
            "mysql://{user}:{password}@{host}:{port}/{}",
            ctx.database_name()
        ),
        tunnel_params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Locality;
    use crate::engine::{EngineTransport, HttpResponse, SmallFileReader};
    use std::collections::{BTreeMap, HashMap};
    use std::path::{Path, PathBuf};

    struct CannedEngine(HashMap<String, String>);

    impl EngineTransport for CannedEngine {
        fn round_trip(&self, _method: &str, path: &str) -> Result<HttpResponse, IslectlError> {
            let (status, body) = match self.0.get(path) {
                Some(body) => (200, body.clone()),
                None => (404, String::new()),
            };
            Ok(HttpResponse {
                status,
                headers: BTreeMap::new(),
                body: body.into_bytes(),
            })
        }

        fn describe(&self) -> String {
            "canned".to_string()
        }
    }

    struct SecretDir(HashMap<PathBuf, String>);

    impl SmallFileReader for SecretDir {
        fn read_small_file(&self, path: &Path) -> String {
            self.0.get(path).cloned().unwrap_or_default()
        }
    }

    const MARIADB: &str = r#"{
        "State": {"Running": true},
        "Config": {"Env": ["DB_ROOT_USER=root", "DB_MYSQL_HOST=mariadb", "DB_MYSQL_PORT=3306"]},
        "HostConfig": {"Mounts": [{"Target": "/run/secrets/DB_ROOT_PASSWORD"}]},
        "NetworkSettings": {"Networks": {"site_default": {"IPAddress": "172.18.0.4"}}}
    }"#;

    const IDE: &str = r#"{
        "State": {"Running": true},
        "Config": {"Env": ["CODE_SERVER_PASSWORD=ide-pass"]}
    }"#;

    fn engine() -> CannedEngine {
        CannedEngine(HashMap::from([
            ("/containers/site-mariadb-prod-1/json".to_string(), MARIADB.to_string()),
            ("/containers/site-ide-1/json".to_string(), IDE.to_string()),
        ]))
    }

    fn secrets(dir: &str) -> SecretDir {
        SecretDir(HashMap::from([(
            PathBuf::from(dir).join("secrets/DB_ROOT_PASSWORD"),
            "pw\n".to_string(),
        )]))
    }

    fn context(locality: Locality) -> DeploymentContext {
        DeploymentContext {
            name: "prod".to_string(),
            locality,
            project_name: "site".to_string(),
            profile: "prod".to_string(),
            project_dir: "/opt/site".to_string(),
            site: "default".to_string(),
            ssh_hostname: "db.example.org".to_string(),
            ssh_port: 22,
            ssh_user: "deploy".to_string(),
            ssh_key_path: "/home/x/.ssh/id_rsa".to_string(),
            ..DeploymentContext::default()
        }
    }

    #[test]
    fn remote_uris_use_private_address_and_key_tunnel() {
        let ctx = context(Locality::Remote);
        let engine = engine();
        let files = secrets("/opt/site");
        let resolver = ContainerResolver::new(&ctx, &engine, &files);
        let uris = database_uris_with(&ctx, &resolver).unwrap();
        assert_eq!(uris.database_uri, "mysql://root:pw@172.18.0.4:3306/drupal_default");
        assert_eq!(
            uris.tunnel_params,
            "ssh_host=db.example.org&ssh_port=22&ssh_user=deploy&ssh_keyLocation=/home/x/.ssh/id_rsa&ssh_keyLocationEnabled=1"
        );
        assert!(!uris.tunnel_params.contains("ssh_password"));
    }

    #[test]
    fn local_uris_use_env_host_and_ide_password() {
        let mut ctx = context(Locality::Local);
        ctx.ssh_hostname = "islandora.dev".to_string();
        ctx.ssh_port = 2222;
        ctx.ssh_user = "nginx".to_string();
        ctx.site = "archive".to_string();
        let engine = engine();
        let files = secrets("/opt/site");
        let resolver = ContainerResolver::new(&ctx, &engine, &files);
        let uris = database_uris_with(&ctx, &resolver).unwrap();
        assert_eq!(uris.database_uri, "mysql://root:pw@mariadb:3306/drupal_archive");
        assert_eq!(
            uris.tunnel_params,
            "ssh_host=islandora.dev&ssh_port=2222&ssh_user=nginx&ssh_password=ide-pass"
        );
        assert_eq!(
            uris.combined(),
            "mysql://root:pw@mariadb:3306/drupal_archive?ssh_host=islandora.dev&ssh_port=2222&ssh_user=nginx&ssh_password=ide-pass"
        );
    }

    #[test]
    fn missing_mariadb_container_is_service_not_found() {
        let mut ctx = context(Locality::Local);
        ctx.profile = "staging".to_string();
        let engine = engine();
        let files = secrets("/opt/site");
        let resolver = ContainerResolver::new(&ctx, &engine, &files);
        let err = database_uris_with(&ctx, &resolver).expect_err("no mariadb");
        assert!(matches!(
            err,
            IslectlError::ServiceNotFound { container, .. } if container == "site-mariadb-staging-1"
        ));
    }
}
