use std::future::Future;
use std::sync::Arc;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use crate::paths::DaemonPaths;

/// Serve JSON-lines requests on the daemon socket. Malformed requests are dropped.
pub async fn run_socket_server<Req, Resp, F, Fut>(paths: &DaemonPaths, handler: F)
where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
{
	run_socket_server_with_error(paths, handler, None::<fn(String) -> Resp>).await;
}

/// Like [`run_socket_server`], but answers malformed requests with `on_invalid(message)`.
pub async fn run_socket_server_with_error<Req, Resp, F, Fut, E>(
	paths: &DaemonPaths,
	handler: F,
	on_invalid: Option<E>,
) where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let socket_path = paths.socket_path();

	let listener = match UnixListener::bind(&socket_path) {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind socket {}: {}", socket_path.display(), e);
			return;
		}
	};

	tracing::info!("listening on {}", socket_path.display());

	let handler = Arc::new(handler);
	let on_invalid = Arc::new(on_invalid);

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let handler = Arc::clone(&handler);
		let on_invalid = Arc::clone(&on_invalid);
		tokio::spawn(async move {
			handle_connection(stream, handler, on_invalid).await;
		});
	}
}

async fn handle_connection<Req, Resp, F, Fut, E>(
	stream: tokio::net::UnixStream,
	handler: Arc<F>,
	on_invalid: Arc<Option<E>>,
) where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		let response = match serde_json::from_str::<Req>(&line) {
			Ok(request) => handler(request).await,
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				match on_invalid.as_ref() {
					Some(make_error) => make_error(format!("invalid request: {}", e)),
					None => continue,
				}
			}
		};

		let mut data = match serde_json::to_vec(&response) {
			Ok(d) => d,
			Err(e) => {
				tracing::error!("failed to serialize response: {}", e);
				continue;
			}
		};
		data.push(b'\n');

		if writer.write_all(&data).await.is_err() {
			break;
		}
	}
}
