//! Socket server: one task per client connection, frames in, frames out.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use strata_config::{log_daemon_debug, log_daemon_error, log_daemon_info, log_roots_warn};
use strata_core::Subscriber;
use strata_ipc::frame::{read_frame, write_frame};
use strata_ipc::{ErrorKind, FrameError, StrataRequest, StrataResponse};

/// Bind the daemon socket, replacing a stale socket file.
pub async fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        tokio::fs::remove_file(path).await?;
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let listener = UnixListener::bind(path)?;
    log_daemon_info!("Listening", socket = tracing::field::debug(path));
    Ok(listener)
}

/// Accept clients until `shutdown` resolves.
pub async fn serve<F>(listener: UnixListener, subscriber: Subscriber, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        tokio::spawn(handle_connection(stream, subscriber.clone()));
                    }
                    Err(e) => {
                        log_daemon_error!("Accept failed", error = tracing::field::display(&e));
                    }
                }
            }
            _ = &mut shutdown => {
                log_daemon_info!("Shutdown signal received");
                break;
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, subscriber: Subscriber) {
    loop {
        let response = match read_frame::<StrataRequest, _>(&mut stream).await {
            Ok(Some(request)) => dispatch(&subscriber, request).await,
            Ok(None) => return,
            // Payload was consumed whole, so the stream is still in sync
            Err(FrameError::Encoding(e)) => StrataResponse::Error {
                kind: ErrorKind::Internal,
                message: format!("Invalid request: {}", e),
            },
            Err(e) => {
                log_daemon_error!("Dropping client", error = tracing::field::display(&e));
                return;
            }
        };

        if let Err(e) = write_frame(&mut stream, &response).await {
            log_daemon_debug!("Client went away", error = tracing::field::display(&e));
            return;
        }
    }
}

fn reply<T>(
    result: strata_core::Result<T>,
    into: impl FnOnce(T) -> StrataResponse,
) -> StrataResponse {
    match result {
        Ok(value) => into(value),
        Err(e) => StrataResponse::error(&e),
    }
}

/// Serve one request against the subscriber.
pub async fn dispatch(subscriber: &Subscriber, request: StrataRequest) -> StrataResponse {
    log_daemon_debug!("Request", request = tracing::field::debug(&request));
    match request {
        StrataRequest::Handshake { client_version } => {
            log_daemon_info!("Handshake", client_version = client_version.as_str());
            StrataResponse::HandshakeAck {
                server_version: env!("CARGO_PKG_VERSION").to_string(),
            }
        }
        StrataRequest::Status => reply(subscriber.status(), StrataResponse::Status),
        StrataRequest::ListRoots => reply(subscriber.list_roots(), StrataResponse::Roots),
        StrataRequest::Subscribe { root } => {
            reply(subscriber.subscribe(&root).await, |()| StrataResponse::Ack)
        }
        StrataRequest::Unsubscribe { root } => {
            reply(subscriber.unsubscribe(&root), StrataResponse::Flag)
        }
        StrataRequest::ListDatasets { root } => reply(
            subscriber.list_datasets(&root).await,
            StrataResponse::Datasets,
        ),
        StrataRequest::Notify { root } => reply(subscriber.notify(&root), StrataResponse::Flag),
        StrataRequest::Info { root, path } => reply(subscriber.get_info(&root, &path).await, |m| {
            StrataResponse::Info(Box::new(m))
        }),
        StrataRequest::Slice {
            root,
            path,
            spec,
            repr,
        } => reply(
            subscriber.get_slice(&root, &path, &spec, repr).await,
            StrataResponse::Slice,
        ),
        StrataRequest::Download { root, path } => reply(
            subscriber.download(&root, &path).await,
            StrataResponse::Data,
        ),
        StrataRequest::PurgeDeleted { root } => {
            reply(subscriber.purge_deleted(&root), StrataResponse::Purged)
        }
    }
}

/// Resync every subscribed root on a fixed period.
///
/// Returns None when polling is disabled (zero interval).
pub fn spawn_poller(subscriber: Subscriber, period: Duration) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            poll_once(&subscriber).await;
        }
    }))
}

async fn poll_once(subscriber: &Subscriber) {
    let roots = match subscriber.subscribed_roots() {
        Ok(roots) => roots,
        Err(e) => {
            log_daemon_error!("Cannot read subscribed roots", error = tracing::field::display(&e));
            return;
        }
    };
    for root in roots {
        if let Err(e) = subscriber.resync(&root).await {
            log_roots_warn!(
                "Background resync failed",
                root = root.as_str(),
                error = tracing::field::display(&e),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_config::testing::TestEnvironment;
    use strata_core::{Representation, SliceSpec};
    use strata_ipc::client::DaemonClient;
    use strata_meta::DType;
    use strata_origin::mock::{array_meta, MockOrigin};

    fn published() -> Arc<MockOrigin> {
        let origin = Arc::new(MockOrigin::new());
        origin.add_dataset(
            "public",
            "/line",
            array_meta(&[4], &[2], DType::U8),
            [(0, vec![1, 2]), (1, vec![3, 4])],
        );
        origin
    }

    #[tokio::test]
    async fn test_dispatch_errors_carry_kind() {
        let env = TestEnvironment::new().unwrap();
        let sub = Subscriber::open(&env.config_with_roots(&["public"]), published()).unwrap();

        let response = dispatch(
            &sub,
            StrataRequest::Info {
                root: "public".into(),
                path: "/line".into(),
            },
        )
        .await;
        assert!(matches!(
            response,
            StrataResponse::Error {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_client_round_trip_over_socket() {
        let env = TestEnvironment::new().unwrap();
        let sub = Subscriber::open(&env.config_with_roots(&["public"]), published()).unwrap();
        let listener = bind(&env.socket_path).await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, sub, async {
            let _ = stop_rx.await;
        }));

        let mut client = DaemonClient::connect_to(&env.socket_path).await.unwrap();
        assert_eq!(client.handshake().await.unwrap(), env!("CARGO_PKG_VERSION"));
        client.subscribe("public").await.unwrap();
        assert_eq!(client.list_datasets("public").await.unwrap(), vec!["/line"]);
        assert_eq!(client.info("public", "/line").await.unwrap().shape, vec![4]);
        assert_eq!(
            client.download("public", "/line").await.unwrap(),
            vec![1, 2, 3, 4]
        );

        let slice = client
            .slice("public", "/line", SliceSpec::Whole, Representation::Raw)
            .await
            .unwrap();
        assert_eq!(slice.regions.len(), 2);
        assert_eq!(client.status().await.unwrap().chunks, 2);

        let err = client.list_datasets("private").await.unwrap_err();
        assert!(err.to_string().contains("NotFound"));

        stop_tx.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_once_marks_removed_datasets() {
        let env = TestEnvironment::new().unwrap();
        let origin = published();
        let sub = Subscriber::open(&env.config_with_roots(&["public"]), origin.clone()).unwrap();
        sub.subscribe("public").await.unwrap();
        sub.get_info("public", "/line").await.unwrap();

        origin.remove_dataset("public", "/line");
        poll_once(&sub).await;
        assert!(sub.get_info("public", "/line").await.is_err());
    }
}
