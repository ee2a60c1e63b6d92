use anyhow::{Result, anyhow};
use headless_chrome::Tab;
use std::sync::Arc;

/// JavaScript that maps a semantic target ("Create project button", "Email
/// field") onto a concrete element and stamps it with a `data-eid` attribute.
///
/// Candidates are scored against their visible text, aria-label, placeholder,
/// name, title and id:
///   3 = exact match, 2 = the candidate contains the target,
///   1 = the target contains the candidate (e.g. "Save button" vs "Save").
/// A `<label>` hit resolves to the control it labels.
/// Returns a `[data-eid="[eN]"]` selector, or null when nothing matches.
const RESOLVE_JS: &str = r#"
(needle) => {
  const q = needle.trim().toLowerCase();
  const CANDIDATES = 'a,button,input,textarea,select,label,[role=button],[role=link],[role=tab],[role=menuitem],[role=option],[contenteditable=true]';

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function texts(el) {
    return [
      el.innerText, el.getAttribute('aria-label'), el.getAttribute('placeholder'),
      el.getAttribute('name'), el.getAttribute('title'), el.id,
    ].filter(Boolean).map(t => t.trim().toLowerCase()).filter(t => t.length > 0);
  }

  let best = null;
  let bestScore = 0;
  for (const el of document.querySelectorAll(CANDIDATES)) {
    if (!isVisible(el)) continue;
    for (const t of texts(el)) {
      let score = 0;
      if (t === q) score = 3;
      else if (t.includes(q)) score = 2;
      else if (t.length > 2 && q.includes(t)) score = 1;
      if (score > bestScore) { best = el; bestScore = score; }
    }
    if (bestScore === 3) break;
  }
  if (!best) return null;
  if (best.tagName === 'LABEL' && best.control) best = best.control;

  if (!best.hasAttribute('data-eid')) {
    const next = document.querySelectorAll('[data-eid]').length;
    best.setAttribute('data-eid', '[e' + next + ']');
  }
  return '[data-eid="' + best.getAttribute('data-eid') + '"]';
}
"#;

const CLEAR_JS: &str = r#"
(sel) => {
  const el = document.querySelector(sel);
  if (el && 'value' in el) el.value = '';
}
"#;

/// Picks an `<option>` by text or value and fires the events frameworks listen for.
const SELECT_JS: &str = r#"
(sel, wanted) => {
  const el = document.querySelector(sel);
  if (!el || !el.options) return false;
  const w = wanted.trim().toLowerCase();
  const opts = [...el.options];
  const opt = opts.find(o => o.text.trim().toLowerCase() === w || o.value.toLowerCase() === w)
    || opts.find(o => o.text.toLowerCase().includes(w));
  if (!opt) return false;
  el.value = opt.value;
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
  return true;
}
"#;

/// A target that already is a selector and needs no resolution.
///
/// `[e3]` is the element-id shorthand; anything starting like a CSS id, class
/// or attribute selector is passed through as is.
pub fn direct_selector(target: &str) -> Option<String> {
    let target = target.trim();
    let is_eid = target.len() > 3
        && target.starts_with("[e")
        && target.ends_with(']')
        && target[2..target.len() - 1].chars().all(|c| c.is_ascii_digit());
    if is_eid {
        return Some(format!("[data-eid=\"{target}\"]"));
    }
    if target.starts_with('#') || target.starts_with('.') || target.starts_with("[data-") {
        return Some(target.to_string());
    }
    None
}

/// Wrap a function literal into an immediately invoked call with JSON-encoded args.
fn invoke(function: &str, args: &[&str]) -> String {
    let args: Vec<String> = args
        .iter()
        .map(|a| serde_json::Value::String(a.to_string()).to_string())
        .collect();
    format!("({})({})", function.trim(), args.join(", "))
}

/// Find the element a description refers to. `Ok(None)` when nothing matches.
pub fn resolve_target(tab: &Arc<Tab>, target: &str) -> Result<Option<String>> {
    if let Some(selector) = direct_selector(target) {
        return Ok(Some(selector));
    }
    let result = tab.evaluate(&invoke(RESOLVE_JS, &[target]), false)?;
    Ok(result.value.and_then(|v| v.as_str().map(String::from)))
}

pub fn clear_value(tab: &Arc<Tab>, selector: &str) -> Result<()> {
    tab.evaluate(&invoke(CLEAR_JS, &[selector]), false)?;
    Ok(())
}

pub fn select_option(tab: &Arc<Tab>, selector: &str, option: &str) -> Result<()> {
    let result = tab.evaluate(&invoke(SELECT_JS, &[selector, option]), false)?;
    match result.value.and_then(|v| v.as_bool()) {
        Some(true) => Ok(()),
        _ => Err(anyhow!("no element found: option '{option}' in {selector}")),
    }
}

/// Get the current page URL.
pub fn get_current_url(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("window.location.href", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| tab.get_url()))
}

/// Get the current page title.
pub fn get_page_title(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.title", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "untitled".to_string()))
}
