use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_SECURITY_POLICY, CONTENT_TYPE};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use std::borrow::Cow;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Permissions granted to previewed code. Top-level navigation is withheld.
pub const SANDBOX: &str = "allow-scripts allow-modals allow-forms allow-popups allow-same-origin";
const SANDBOX_CSP: &str =
    "sandbox allow-scripts allow-modals allow-forms allow-popups allow-same-origin";

pub const TAILWIND_CDN: &str = "https://cdn.tailwindcss.com";

const PLACEHOLDER_DOCUMENT: &str = r#"<html>
  <body style="background-color: #0a0a0a; display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; color: #333; font-family: sans-serif;">
    <div style="opacity: 0.2">waiting for signal...</div>
  </body>
</html>
"#;

fn is_full_document(code: &str) -> bool {
    let lower = code.to_ascii_lowercase();
    lower.contains("<!doctype html") || lower.contains("<html")
}

/// The document the preview shows for `code`.
///
/// Full HTML documents pass through untouched; fragments are placed in the
/// body of a minimal page that loads Tailwind.
pub fn render_document(code: &str) -> Cow<'_, str> {
    if code.trim().is_empty() {
        return Cow::Borrowed(PLACEHOLDER_DOCUMENT);
    }
    if is_full_document(code) {
        return Cow::Borrowed(code);
    }

    Cow::Owned(format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <script src="{TAILWIND_CDN}"></script>
    <style>
      body {{ background-color: white; }}
    </style>
  </head>
  <body>
{code}
  </body>
</html>
"#
    ))
}

fn host_page() -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8" />
    <title>кодъ preview</title>
    <style>
      html, body {{ margin: 0; height: 100%; background: #0a0a0a; }}
      iframe {{ border: none; width: 100%; height: 100%; background: white; }}
    </style>
  </head>
  <body>
    <iframe id="preview" title="preview" src="/preview" sandbox="{SANDBOX}"></iframe>
    <script>
      const frame = document.getElementById("preview");
      new EventSource("/events").addEventListener("update", () => {{
        frame.src = "/preview?t=" + Date.now();
      }});
    </script>
  </body>
</html>
"#
    )
}

/// Publishes editor text to the preview server.
#[derive(Clone)]
pub struct PreviewHandle {
    code: Arc<watch::Sender<String>>,
    addr: Option<SocketAddr>,
}

impl PreviewHandle {
    pub fn detached() -> (Self, watch::Receiver<String>) {
        let (tx, rx) = watch::channel(String::new());
        (
            Self {
                code: Arc::new(tx),
                addr: None,
            },
            rx,
        )
    }

    pub fn url(&self) -> Option<String> {
        self.addr.map(|addr| format!("http://{}/", addr))
    }

    /// Returns whether the text differed from what was last published.
    pub fn publish(&self, code: &str) -> bool {
        self.code.send_if_modified(|current| {
            if current == code {
                false
            } else {
                code.clone_into(current);
                true
            }
        })
    }
}

pub fn router(code: watch::Receiver<String>) -> Router {
    Router::new()
        .route("/", get(host))
        .route("/preview", get(preview))
        .route("/events", get(events))
        .with_state(code)
}

/// Binds the preview server and serves it on a background task.
pub async fn spawn(listen: &str) -> std::io::Result<PreviewHandle> {
    let (mut handle, code) = PreviewHandle::detached();
    let listener = tokio::net::TcpListener::bind(listen).await?;
    let addr = listener.local_addr()?;
    handle.addr = Some(addr);

    let app = router(code);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "preview server stopped");
        }
    });
    tracing::info!(%addr, "preview server listening");

    Ok(handle)
}

async fn host() -> Html<String> {
    Html(host_page())
}

async fn preview(State(code): State<watch::Receiver<String>>) -> impl IntoResponse {
    let document = render_document(&code.borrow()).into_owned();
    (
        [
            (CONTENT_TYPE, "text/html; charset=utf-8"),
            (CONTENT_SECURITY_POLICY, SANDBOX_CSP),
            (CACHE_CONTROL, "no-store"),
        ],
        document,
    )
}

async fn events(State(mut code): State<watch::Receiver<String>>) -> impl IntoResponse {
    code.mark_unchanged();
    let stream = WatchStream::from_changes(code).map(|code| {
        Ok::<Event, Infallible>(
            Event::default()
                .event("update")
                .data(code.chars().count().to_string()),
        )
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
