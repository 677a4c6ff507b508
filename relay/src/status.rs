//! Minimal HTTP status page: `/` renders a shell that fetches `/stats.json`,
//! which serves the supervisor's latest snapshot.

use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>EDI relay</title></head>
<body>
<h1>EDI relay</h1>
<pre id="stats">loading&hellip;</pre>
<script>
async function refresh() {
  const r = await fetch('/stats.json');
  document.getElementById('stats').textContent = JSON.stringify(await r.json(), null, 2);
}
refresh(); setInterval(refresh, 2000);
</script>
</body>
</html>
"#;

pub async fn run(
    port: u16,
    snapshot: Arc<Mutex<String>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("status page listening on port {}", listener.local_addr()?.port());
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("status request from {peer}");
                    let snapshot = snapshot.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_request(stream, snapshot).await {
                            debug!("status request failed: {err}");
                        }
                    });
                }
                Err(err) => {
                    warn!("status page accept failed: {err}");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn serve_request(mut stream: TcpStream, snapshot: Arc<Mutex<String>>) -> std::io::Result<()> {
    let mut buf = vec![0u8; 2048];
    let len = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..len]);
    let path = request.split_whitespace().nth(1).unwrap_or("/");

    let (status, content_type, body) = match path {
        "/" | "/index.html" => ("200 OK", "text/html", INDEX_HTML.to_string()),
        "/stats.json" => ("200 OK", "application/json", snapshot.lock().clone()),
        _ => ("404 Not Found", "text/plain", "not found\n".to_string()),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_snapshot_json() {
        let snapshot = Arc::new(Mutex::new(String::from("{\"output\":{\"num_frames\":3}}")));
        let (_guard, shutdown) = watch::channel(false);
        // bind on an ephemeral port by probing through a throwaway listener
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        tokio::spawn(run(port, snapshot, shutdown));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        stream.write_all(b"GET /stats.json HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut response = String::new();
        timeout(Duration::from_secs(2), stream.read_to_string(&mut response)).await.expect("read").unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"num_frames\":3"));
    }
}
