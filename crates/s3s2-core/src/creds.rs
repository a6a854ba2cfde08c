use std::sync::Arc;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::S3Store;

/// Lifetime requested for temporary credentials.
pub const EXPIRY_WINDOW_SECONDS: u64 = 3600;
/// Rotation happens this long before the credentials lapse.
const REFRESH_LEAD: Duration = Duration::from_secs(120);
const SESSION_NAME: &str = "s3s2-federated-identity";

const METADATA_TOKEN_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity?audience=unused&format=full";

#[derive(Debug, thiserror::Error)]
pub enum CredsError {
    #[error("not in Kubernetes")]
    NotInKubernetes,
    #[error("neither --aws-role-arn nor $AWS_ROLE_ARN provided")]
    NoRoleArn,
    #[error("identity token error: {0}")]
    IdentityToken(String),
    #[error("assume role error: {0}")]
    AssumeRole(String),
}

/// The federated path only applies on a cluster workload; role and region
/// fall back to the environment.
pub fn resolve_role_arn(flag: Option<&str>) -> Result<String, CredsError> {
    if std::env::var_os("KUBERNETES_SERVICE_HOST").is_none() {
        return Err(CredsError::NotInKubernetes);
    }
    match flag {
        Some(arn) => Ok(arn.to_string()),
        None => std::env::var("AWS_ROLE_ARN").map_err(|_| CredsError::NoRoleArn),
    }
}

pub fn resolve_region(flag: &str) -> String {
    if !flag.is_empty() {
        return flag.to_string();
    }
    match std::env::var("AWS_REGION") {
        Ok(region) => region,
        Err(_) => {
            warn!("neither --region nor $AWS_REGION defined; defaulting to 'us-east-1'");
            "us-east-1".to_string()
        }
    }
}

/// Obtains a workload identity token from the platform metadata server.
pub async fn fetch_identity_token() -> Result<String, CredsError> {
    let client = reqwest::Client::new();
    let response = client
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| CredsError::IdentityToken(e.to_string()))?;
    if !response.status().is_success() {
        return Err(CredsError::IdentityToken(format!(
            "metadata server returned {}",
            response.status()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| CredsError::IdentityToken(e.to_string()))
}

/// Exchanges the identity token for temporary object-store credentials.
pub async fn assume_web_identity(
    region: &str,
    role_arn: &str,
    token: &str,
) -> Result<Credentials, CredsError> {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .no_credentials()
        .load()
        .await;
    let client = aws_sdk_sts::Client::new(&config);

    let output = client
        .assume_role_with_web_identity()
        .role_arn(role_arn)
        .role_session_name(SESSION_NAME)
        .web_identity_token(token)
        .duration_seconds(EXPIRY_WINDOW_SECONDS as i32)
        .send()
        .await
        .map_err(|e| CredsError::AssumeRole(e.to_string()))?;

    let creds = output
        .credentials
        .ok_or_else(|| CredsError::AssumeRole("response carried no credentials".to_string()))?;
    Ok(Credentials::new(
        creds.access_key_id,
        creds.secret_access_key,
        Some(creds.session_token),
        None,
        SESSION_NAME,
    ))
}

struct RefresherTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background credential rotation, owned by the pipeline. `start` is
/// idempotent while a task is running; `stop` signals the task and waits for
/// it, after which `start` may launch anew.
#[derive(Default)]
pub struct CredentialRefresher {
    inner: Mutex<Option<RefresherTask>>,
}

impl CredentialRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, store: Arc<S3Store>, role_arn: &str, region: &str) {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            debug!("credential refresher already running");
            return;
        }

        info!(role_arn, "starting credential refresher");
        let (stop, mut stopped) = watch::channel(false);
        let role_arn = role_arn.to_string();
        let region = region.to_string();
        let handle = tokio::spawn(async move {
            let wait = Duration::from_secs(EXPIRY_WINDOW_SECONDS) - REFRESH_LEAD;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stopped.changed() => {
                        debug!("credential refresher stopping");
                        return;
                    }
                }
                match rotate(&store, &role_arn, &region).await {
                    Ok(()) => info!("rotated object-store credentials"),
                    Err(e) => warn!(error = %e, "credential rotation failed; will retry next window"),
                }
            }
        });

        *guard = Some(RefresherTask { stop, handle });
    }

    pub async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.take() {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
            debug!("credential refresher stopped");
        }
    }
}

async fn rotate(store: &S3Store, role_arn: &str, region: &str) -> Result<(), CredsError> {
    let token = fetch_identity_token().await?;
    let creds = assume_web_identity(region, role_arn, &token).await?;
    store.install_credentials(creds).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn opts() -> Options {
        Options {
            bucket: "bkt".into(),
            region: "us-east-1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears() {
        let store = Arc::new(S3Store::new(&opts()).await);
        let refresher = CredentialRefresher::new();

        refresher
            .start(store.clone(), "arn:aws:iam::1:role/x", "us-east-1")
            .await;
        refresher
            .start(store.clone(), "arn:aws:iam::1:role/x", "us-east-1")
            .await;
        assert!(refresher.inner.lock().await.is_some());

        refresher.stop().await;
        assert!(refresher.inner.lock().await.is_none());

        // a stopped refresher may be started again
        refresher.start(store, "arn:aws:iam::1:role/x", "us-east-1").await;
        refresher.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let refresher = CredentialRefresher::new();
        refresher.stop().await;
    }

    #[test]
    fn region_flag_wins() {
        assert_eq!(resolve_region("eu-west-1"), "eu-west-1");
    }
}
