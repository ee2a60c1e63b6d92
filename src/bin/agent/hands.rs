use agentic_rpa::artifacts::ArtifactStore;
use agentic_rpa::config::BrowserConfig;
use agentic_rpa::{
    Action, ActionType, BlockingLane, BrowserConnection, ConnectionError, ExecutionEngine,
    ExecutionError, Observation, SessionHandle, StepContext, StepOutcome,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::browser::tab::EventListener;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dom;

/// How long element lookups and navigations may take inside one step.
const ELEMENT_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_POLL: Duration = Duration::from_millis(250);
const DEFAULT_WAIT: Duration = Duration::from_secs(1);
const MAX_EXPLICIT_WAIT: Duration = Duration::from_secs(30);

type TabListener = dyn EventListener<Event> + Send + Sync;

/// The browser and the one tab every step works on.
struct Live {
    browser: Arc<Browser>,
    tab: Arc<Tab>,
}

/// Persistent browser connection. Created once, reused for every task.
///
/// Attaches to a Chrome already listening on the debug port, or launches one
/// on that port with a persistent profile. Either way a later reconnect goes
/// through the debug port and lands on the same process and tab.
pub struct ChromeConnection {
    config: BrowserConfig,
    live: Arc<Mutex<Live>>,
    /// Every listener added to the tab that has not been removed yet.
    listeners: Arc<Mutex<Vec<Weak<TabListener>>>>,
    wiring: BlockingLane<Result<ChromeHandle, ConnectionError>>,
    /// Dropping a launched `Browser` kills its process.
    _launched: Option<Arc<Browser>>,
}

/// Per-step wiring: the shared tab plus a listener owned by this handle only.
pub struct ChromeHandle {
    pub tab: Arc<Tab>,
    generation: u64,
    listener: Weak<TabListener>,
    events: Arc<AtomicU64>,
}

impl ChromeConnection {
    pub async fn open(config: BrowserConfig) -> Result<Self> {
        if config.attach_first {
            info!(port = config.debug_port, "Attempting to attach to running Chrome");
            match attach(&config.debug_endpoint(), None).await {
                Ok(live) => {
                    info!("Attached to running Chrome");
                    return Ok(Self::with_live(config, live, None));
                }
                Err(e) => warn!(error = %e, "Could not attach, launching Chrome"),
            }
        }

        let launch_config = config.clone();
        let live = tokio::task::spawn_blocking(move || launch(&launch_config))
            .await
            .context("browser launch task panicked")??;
        let launched = Arc::clone(&live.browser);
        info!(port = config.debug_port, "Chrome ready");

        Ok(Self::with_live(config, live, Some(launched)))
    }

    fn with_live(config: BrowserConfig, live: Live, launched: Option<Arc<Browser>>) -> Self {
        Self {
            config,
            live: Arc::new(Mutex::new(live)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            wiring: BlockingLane::new(),
            _launched: launched,
        }
    }
}

#[async_trait]
impl BrowserConnection for ChromeConnection {
    type Handle = ChromeHandle;

    async fn probe(&self) -> Result<(), ConnectionError> {
        let live = Arc::clone(&self.live);
        blocking(move || {
            let live = lock(&live)?;
            live.browser
                .get_version()
                .map_err(|e| ConnectionError::Unreachable(format!("{e:#}")))?;
            live.tab
                .evaluate("1", false)
                .map_err(|e| ConnectionError::Unreachable(format!("tab unresponsive: {e:#}")))?;
            Ok(())
        })
        .await
    }

    async fn reconnect(&self) -> Result<(), ConnectionError> {
        let target = lock(&self.live)?.tab.get_target_id().clone();
        let fresh = attach(&self.config.debug_endpoint(), Some(target)).await?;
        *lock(&self.live)? = fresh;
        Ok(())
    }

    async fn wire(&self, generation: u64) -> Result<ChromeHandle, ConnectionError> {
        let live = Arc::clone(&self.live);
        let listeners = Arc::clone(&self.listeners);
        // on the lane, so a wiring abandoned by a timeout lands before the sweep
        self.wiring
            .run(move || {
                let tab = Arc::clone(&lock(&live)?.tab);
                tab.set_default_timeout(ELEMENT_TIMEOUT);

                let mut registered = lock(&listeners)?;
                let stale = std::mem::take(&mut *registered);
                if !stale.is_empty() {
                    warn!(count = stale.len(), "Removing listeners left by abandoned handles");
                }
                for listener in &stale {
                    if let Err(e) = tab.remove_event_listener(listener) {
                        debug!(error = %e, "Stale listener already gone");
                    }
                }

                let events = Arc::new(AtomicU64::new(0));
                let counter = Arc::clone(&events);
                let listener: Arc<TabListener> = Arc::new(move |_event: &Event| {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
                let listener = tab
                    .add_event_listener(listener)
                    .map_err(|e| ConnectionError::Wiring(format!("{e:#}")))?;
                registered.push(listener.clone());

                Ok(ChromeHandle {
                    tab,
                    generation,
                    listener,
                    events,
                })
            })
            .await
            .map_err(|e| ConnectionError::Wiring(format!("wiring task panicked: {e}")))?
    }

    async fn unwire(&self, handle: ChromeHandle) {
        debug!(
            generation = handle.generation,
            events = handle.events.load(Ordering::Relaxed),
            "Removing handle listener"
        );
        let listeners = Arc::clone(&self.listeners);
        let result = tokio::task::spawn_blocking(move || {
            handle.tab.remove_event_listener(&handle.listener)?;
            // left registered on failure so the next wiring retries it
            if let Ok(mut registered) = lock(&listeners) {
                registered.retain(|l| !Weak::ptr_eq(l, &handle.listener));
            }
            Ok::<_, anyhow::Error>(())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Listener already gone"),
            Err(e) => warn!(error = %e, "Unwire task panicked"),
        }
    }
}

/// Performs actions on the tab of a [`ChromeHandle`].
///
/// Actions run one after another on a [`BlockingLane`]: an action the
/// orchestrator stopped waiting for still finishes before the next one
/// touches the tab.
pub struct ChromeEngine {
    artifacts: ArtifactStore,
    settle: Duration,
    work: BlockingLane<Result<StepOutcome, ExecutionError>>,
}

impl ChromeEngine {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self {
            artifacts,
            settle: Duration::from_millis(1000),
            work: BlockingLane::new(),
        }
    }
}

#[async_trait]
impl ExecutionEngine<ChromeHandle> for ChromeEngine {
    async fn execute(
        &self,
        action: &Action,
        handle: &SessionHandle<ChromeHandle>,
        ctx: StepContext<'_>,
    ) -> Result<StepOutcome, ExecutionError> {
        let tab = Arc::clone(&handle.inner().tab);
        let action = action.clone();
        let artifacts = self.artifacts.clone();
        let settle = self.settle;
        let step_index = ctx.step_index;
        let task = ctx.task.to_string();
        let deadline = Instant::now() + ctx.budget;

        // headless_chrome is blocking; keep it off the runtime threads
        self.work
            .run(move || {
                perform(&tab, &action, settle, deadline)?;

                let mut outcome = StepOutcome::success();
                if action.wants_observation() {
                    let action_type = action.action_type();
                    outcome = match capture(&tab, &artifacts, step_index, action_type, &task) {
                        Ok(observation) => outcome.with_observation(observation),
                        Err(e) => outcome.with_capture_error(format!("{e:#}")),
                    };
                }
                Ok(outcome)
            })
            .await
            .map_err(|e| ExecutionError::Crash(format!("execution task panicked: {e}")))?
    }
}

/// Time left until `deadline`, at most `cap`.
fn within(deadline: Instant, cap: Duration) -> Duration {
    deadline.saturating_duration_since(Instant::now()).min(cap)
}

fn perform(
    tab: &Arc<Tab>,
    action: &Action,
    settle: Duration,
    deadline: Instant,
) -> Result<(), ExecutionError> {
    let target = action.target_description();
    let value = action.value().unwrap_or_default();

    match action.action_type() {
        ActionType::Navigate => {
            tab.navigate_to(value).map_err(classify)?;
            tab.wait_until_navigated().map_err(classify)?;
            std::thread::sleep(within(deadline, settle));
        }
        ActionType::Click => {
            let selector = locate(tab, target)?;
            tab.find_element(&selector).map_err(classify)?.click().map_err(classify)?;
            std::thread::sleep(within(deadline, settle));
        }
        ActionType::Type => {
            let selector = locate(tab, target)?;
            tab.find_element(&selector).map_err(classify)?.click().map_err(classify)?;
            dom::clear_value(tab, &selector).map_err(classify)?;
            tab.type_str(value).map_err(classify)?;
        }
        ActionType::Select => {
            let selector = locate(tab, target)?;
            dom::select_option(tab, &selector, value).map_err(classify)?;
            std::thread::sleep(within(deadline, settle));
        }
        ActionType::Wait => wait(tab, action, deadline)?,
        ActionType::CaptureScreenshot | ActionType::EvaluateState | ActionType::Complete => {}
    }
    Ok(())
}

fn locate(tab: &Arc<Tab>, target: &str) -> Result<String, ExecutionError> {
    dom::resolve_target(tab, target)
        .map_err(classify)?
        .ok_or_else(|| ExecutionError::ElementNotFound(target.to_string()))
}

/// `value` in milliseconds, else until `target` shows up, else a short pause.
fn wait(tab: &Arc<Tab>, action: &Action, deadline: Instant) -> Result<(), ExecutionError> {
    if !action.wait_conditions().is_empty() {
        debug!(conditions = ?action.wait_conditions(), "Waiting");
    }
    if let Some(ms) = action.value().and_then(|v| v.parse::<u64>().ok()) {
        let requested = Duration::from_millis(ms).min(MAX_EXPLICIT_WAIT);
        std::thread::sleep(within(deadline, requested));
        return Ok(());
    }

    let target = action.target_description();
    if target.is_empty() {
        std::thread::sleep(within(deadline, DEFAULT_WAIT));
        return Ok(());
    }
    let limit = within(deadline, ELEMENT_TIMEOUT);
    let started = Instant::now();
    while started.elapsed() < limit {
        if dom::resolve_target(tab, target).map_err(classify)?.is_some() {
            return Ok(());
        }
        std::thread::sleep(within(deadline, WAIT_POLL));
    }
    Err(ExecutionError::Timeout(format!(
        "'{target}' did not appear within {limit:?}"
    )))
}

fn capture(
    tab: &Arc<Tab>,
    artifacts: &ArtifactStore,
    step_index: usize,
    action_type: ActionType,
    task: &str,
) -> Result<Observation> {
    let path = artifacts.observation_path(step_index, action_type, task)?;
    let png = tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
    std::fs::write(&path, png).with_context(|| format!("writing {}", path.display()))?;
    debug!(
        path = %path.display(),
        title = dom::get_page_title(tab).unwrap_or_default(),
        "Captured observation"
    );
    Ok(Observation {
        handle: path.display().to_string(),
        url: dom::get_current_url(tab).ok(),
    })
}

/// headless_chrome reports everything as `anyhow::Error`; sort by message.
fn classify(e: anyhow::Error) -> ExecutionError {
    let message = format!("{e:#}");
    let lower = message.to_lowercase();
    if lower.contains("no element")
        || lower.contains("not found")
        || lower.contains("find element")
    {
        ExecutionError::ElementNotFound(message)
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("never came")
    {
        ExecutionError::Timeout(message)
    } else {
        ExecutionError::Crash(message)
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ConnectionError>
where
    F: FnOnce() -> Result<T, ConnectionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConnectionError::Wiring(format!("browser task panicked: {e}")))?
}

fn lock<T>(state: &Mutex<T>) -> Result<MutexGuard<'_, T>, ConnectionError> {
    state
        .lock()
        .map_err(|_| ConnectionError::Wiring("browser state lock poisoned".into()))
}

/// `webSocketDebuggerUrl` of the Chrome behind a debug endpoint.
async fn browser_ws_url(endpoint: &str) -> Result<String, ConnectionError> {
    let url = format!("{endpoint}/json/version");
    let version: serde_json::Value = reqwest::get(&url)
        .await
        .map_err(|e| ConnectionError::Unreachable(format!("{url}: {e}")))?
        .json()
        .await
        .map_err(|e| ConnectionError::Unreachable(format!("{url}: {e}")))?;
    version["webSocketDebuggerUrl"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| {
            ConnectionError::Unreachable(format!("{url} reported no webSocketDebuggerUrl"))
        })
}

async fn attach(endpoint: &str, keep_target: Option<String>) -> Result<Live, ConnectionError> {
    let ws_url = browser_ws_url(endpoint).await?;
    blocking(move || {
        let browser =
            Browser::connect(ws_url).map_err(|e| ConnectionError::Unreachable(format!("{e:#}")))?;
        let tab = pick_tab(&browser, keep_target.as_deref())?;
        Ok(Live {
            browser: Arc::new(browser),
            tab,
        })
    })
    .await
}

/// The tab with `keep_target` if it still exists, else the first one, else a new one.
fn pick_tab(browser: &Browser, keep_target: Option<&str>) -> Result<Arc<Tab>, ConnectionError> {
    // targets of an attached browser are discovered asynchronously
    for _ in 0..20 {
        let tabs = browser
            .get_tabs()
            .lock()
            .map_err(|_| ConnectionError::Wiring("tab list lock poisoned".into()))?;
        let kept = keep_target.and_then(|id| tabs.iter().find(|t| t.get_target_id() == id));
        if let Some(tab) = kept.or_else(|| tabs.first()) {
            debug!(target_id = %tab.get_target_id(), "Using existing tab");
            return Ok(Arc::clone(tab));
        }
        drop(tabs);
        std::thread::sleep(Duration::from_millis(50));
    }
    debug!("No tabs found, creating one");
    browser
        .new_tab()
        .map_err(|e| ConnectionError::Wiring(format!("{e:#}")))
}

fn launch(config: &BrowserConfig) -> Result<Live> {
    let profile = match &config.profile_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?.join("agent_profile"),
    };
    if !profile.exists() {
        info!(profile = %profile.display(), "Creating persistent profile");
        std::fs::create_dir_all(&profile)?;
        if let Err(e) = seed_profile(&profile) {
            warn!(error = %e, "Profile seeding failed");
        }
    } else {
        debug!(profile = %profile.display(), "Using existing persistent profile");
    }

    let options = LaunchOptions {
        headless: config.headless,
        path: config.chrome_path.clone().or_else(find_chrome),
        user_data_dir: Some(profile),
        // fixed port so a reconnect can find the same process
        port: Some(config.debug_port),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--password-store=basic"),
        ],
        idle_browser_timeout: Duration::from_secs(config.idle_timeout_secs),
        ..Default::default()
    };

    info!(headless = config.headless, "Starting Chrome");
    let browser = Browser::new(options).context("browser launch failed")?;
    let tab = browser.new_tab()?;
    tab.navigate_to("about:blank")?;

    Ok(Live {
        browser: Arc::new(browser),
        tab,
    })
}

/// Where the user's own Chrome keeps its profiles on this platform.
fn real_user_data_dir() -> Option<PathBuf> {
    if cfg!(target_os = "windows") {
        dirs::data_local_dir().map(|d| d.join("Google").join("Chrome").join("User Data"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir().map(|d| d.join("Google").join("Chrome"))
    } else {
        dirs::config_dir().map(|d| d.join("google-chrome"))
    }
}

/// Copy cookies and logins from the user's Chrome so a new profile starts signed in.
fn seed_profile(profile: &Path) -> Result<()> {
    let Some(real) = real_user_data_dir().filter(|d| d.exists()) else {
        return Ok(());
    };

    // "Local State" holds the key that decrypts cookies
    let _ = std::fs::copy(real.join("Local State"), profile.join("Local State"));

    let copy_all = |from: &Path, to: &Path, names: &[&str]| -> Result<()> {
        std::fs::create_dir_all(to)?;
        for name in names {
            let src = from.join(name);
            if src.exists() {
                let _ = std::fs::copy(&src, to.join(name));
            }
        }
        Ok(())
    };

    let real_default = real.join("Default");
    let agent_default = profile.join("Default");
    copy_all(
        &real_default,
        &agent_default,
        &[
            "Cookies",
            "Cookies-journal",
            "Login Data",
            "Login Data-journal",
            "Web Data",
            "Preferences",
            "Secure Preferences",
        ],
    )?;
    if real_default.join("Network").exists() {
        copy_all(
            &real_default.join("Network"),
            &agent_default.join("Network"),
            &["Cookies", "Cookies-journal", "Network Persistent State"],
        )?;
    }
    Ok(())
}

fn find_chrome() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if cfg!(target_os = "windows") {
        candidates.push(r"C:\Program Files\Google\Chrome\Application\chrome.exe".into());
        candidates.push(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe".into());
        if let Some(local) = dirs::data_local_dir() {
            candidates.push(local.join(r"Google\Chrome\Application\chrome.exe"));
        }
    } else if cfg!(target_os = "macos") {
        candidates.push("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome".into());
    } else {
        for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
            candidates.push(Path::new("/usr/bin").join(name));
        }
    }
    // None lets headless_chrome look on its own
    candidates.into_iter().find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_browser_errors() {
        let err = classify(anyhow::anyhow!("No element found"));
        assert_eq!(err.kind(), "element-not-found");

        let err = classify(anyhow::anyhow!("The event waited for never came"));
        assert_eq!(err.kind(), "timeout");

        let err = classify(anyhow::anyhow!(
            "Unable to make method calls because underlying connection is closed"
        ));
        assert_eq!(err.kind(), "crash");
    }

    #[test]
    fn test_waits_end_by_the_call_deadline() {
        let deadline = Instant::now() + Duration::from_millis(200);
        assert!(within(deadline, MAX_EXPLICIT_WAIT) <= Duration::from_millis(200));
        assert_eq!(within(deadline, Duration::ZERO), Duration::ZERO);

        let passed = Instant::now() - Duration::from_millis(1);
        assert_eq!(within(passed, ELEMENT_TIMEOUT), Duration::ZERO);
    }
}
