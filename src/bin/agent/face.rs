use agentic_rpa::RunEvent;
use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub cmd_tx: mpsc::Sender<String>,
    pub event_tx: broadcast::Sender<RunEvent>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Serve the web UI on the first free port of `ports`.
///
/// Returns the receiving end for submitted tasks; run events sent on
/// `event_tx` are streamed to every open page.
pub async fn start_server(
    ports: std::ops::Range<u16>,
    event_tx: broadcast::Sender<RunEvent>,
) -> Result<mpsc::Receiver<String>> {
    // one task at a time; a second submit waits for the first to be taken
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(1);
    let state = Arc::new(AppState { cmd_tx, event_tx });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for port in ports.clone() {
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                bound = Some((listener, port));
                break;
            }
            Err(e) => debug!(port, error = %e, "Port unavailable"),
        }
    }
    let (listener, port) = bound.with_context(|| {
        format!(
            "could not bind to any port {}-{}; is another agent running?",
            ports.start,
            ports.end.saturating_sub(1)
        )
    })?;

    info!("Web UI running at http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Web UI server stopped");
        }
    });

    Ok(cmd_rx)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> (StatusCode, &'static str) {
    let command = payload.command.trim().to_string();
    if command.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty command");
    }
    info!(command = %command, "Task submitted");
    match state.cmd_tx.send(command).await {
        Ok(()) => (StatusCode::ACCEPTED, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "agent is shutting down"),
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => match Event::default().event(event.name()).json_data(&event) {
            Ok(sse) => Some(Ok::<_, Infallible>(sse)),
            Err(e) => {
                warn!(error = %e, "Could not encode run event");
                None
            }
        },
        // lagged subscriber: skip what was missed
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Agentic RPA</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 20px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 18px; font-weight: 600; color: #fff; }
  header .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  header .dot.busy { background: #f59e0b; }
  .main {
    flex: 1;
    display: flex;
    flex-direction: column;
    max-width: 860px;
    width: 100%;
    margin: 0 auto;
    padding: 24px 32px;
    gap: 16px;
    overflow: hidden;
  }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .entry { padding: 8px 12px; border-radius: 6px; font-size: 14px; line-height: 1.5; }
  .entry.user { background: #1a1a2e; border-left: 3px solid #6366f1; }
  .entry.step { background: #111118; border-left: 3px solid #3b82f6; font-family: 'Fira Code', monospace; font-size: 13px; }
  .entry.step .num { color: #6366f1; font-weight: 700; margin-right: 8px; }
  .entry.error { background: #1a0a0a; border-left: 3px solid #ef4444; color: #fca5a5; }
  .entry.retry { background: #111118; border-left: 3px solid #f59e0b; color: #fcd34d; font-size: 13px; }
  .entry.done { background: #0a1a0a; border-left: 3px solid #22c55e; color: #86efac; }
  .input-area { display: flex; gap: 8px; }
  #cmd {
    flex: 1;
    background: #111118;
    border: 1px solid #222;
    border-radius: 8px;
    padding: 12px 16px;
    color: #fff;
    font-size: 16px;
    outline: none;
  }
  #cmd:focus { border-color: #6366f1; }
  #cmd:disabled { opacity: 0.5; }
  button {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 12px 24px;
    font-size: 15px;
    font-weight: 600;
    cursor: pointer;
  }
  button:disabled { background: #333; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>Agentic RPA</h1>
  </header>
  <div class="main">
    <div id="log"></div>
    <div class="input-area">
      <input type="text" id="cmd" placeholder="Describe the task..." autofocus />
      <button id="send" onclick="send()">Run</button>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const sendBtn = document.getElementById('send');
  const dot = document.getElementById('status-dot');
  const esc = s => String(s ?? '').replace(/&/g,'&amp;').replace(/</g,'&lt;');
  let busy = false;

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  function setBusy(b) {
    busy = b;
    cmd.disabled = b;
    sendBtn.disabled = b;
    dot.className = b ? 'dot busy' : 'dot';
    if (!b) cmd.focus();
  }

  async function send() {
    const text = cmd.value.trim();
    if (!text || busy) return;
    cmd.value = '';
    addEntry('user', '<strong>Task:</strong> ' + esc(text));
    setBusy(true);
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command: text}),
    });
  }

  cmd.addEventListener('keydown', e => { if (e.key === 'Enter') send(); });

  const es = new EventSource('/events');

  es.addEventListener('started', () => setBusy(true));

  es.addEventListener('step_recorded', e => {
    const s = JSON.parse(e.data).step;
    const what = esc(s.action_type) + (s.target_description ? ' ' + esc(s.target_description) : '')
      + (s.value ? ' = ' + esc(s.value) : '');
    if (s.status === 'error') {
      addEntry('error', '<span class="num">Step ' + s.step_index + '</span>' + what + '<br>' + esc(s.error_message));
    } else {
      addEntry('step', '<span class="num">Step ' + s.step_index + '</span>' + what + ' : ' + esc(s.status));
    }
  });

  es.addEventListener('retrying', e => {
    const d = JSON.parse(e.data);
    addEntry('retry', 'Retrying ' + esc(d.boundary) + ' (' + d.retry + ') in ' + d.delay_ms + ' ms: ' + esc(d.error));
  });

  es.addEventListener('finished', e => {
    const d = JSON.parse(e.data);
    if (d.status === 'completed') {
      addEntry('done', '<strong>Completed</strong> after ' + d.step_count + ' steps. ' + esc(d.summary));
    } else {
      addEntry('error', '<strong>' + esc(d.status) + '</strong> after ' + d.step_count + ' steps. ' + esc(d.failure_reason));
    }
    setBusy(false);
  });

  addEntry('done', 'Agent ready. Describe a task to begin.');
</script>
</body>
</html>
"##;
