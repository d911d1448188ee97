// packages/subpath-agent/src/interception/navigation.rs
//! Navigation fixup script injection
//!
//! Fetch interception cannot see navigations the page starts itself (anchor
//! clicks, `history.pushState`, `window.open`, form posts, back/forward). For
//! HTML documents we inject a small script, parameterised with the scope, that
//! applies the same fixup rule in the page before any page script runs.
//!
//! Fixup rule: a URL is corrected iff it starts with `/`, is not already
//! scope-prefixed, and is not absolute, protocol-relative, `mailto:`, `tel:`,
//! `javascript:`, `data:`, `blob:`, or a fragment/query-only reference.

use crate::interception::scope::Scope;
use crate::utils::errors::{AgentError, Result};
use bytes::{Bytes, BytesMut};
use hyper::header::{HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Response};
use std::borrow::Cow;
use tracing::debug;

const SCOPE_PLACEHOLDER: &str = "__SUBPATH_SCOPE__";

const NAVIGATION_SCRIPT_TEMPLATE: &str = r#"(function () {
  if (window.__subpathNavigationPatched) return;
  window.__subpathNavigationPatched = true;

  var SCOPE = __SUBPATH_SCOPE__;
  var BASE = SCOPE.replace(/\/$/, '');
  var SKIP = /^(?:[a-zA-Z][a-zA-Z0-9+.\-]*:|\/\/|#|\?)/;

  function needsFix(url) {
    if (typeof url !== 'string' || url.charAt(0) !== '/') return false;
    if (SKIP.test(url)) return false;
    if (url === BASE || url.indexOf(SCOPE) === 0) return false;
    return true;
  }

  function fix(url) {
    return needsFix(url) ? BASE + url : url;
  }

  function fixAny(url) {
    if (typeof URL !== 'undefined' && url instanceof URL) {
      if (url.origin !== location.origin) return url;
      var relative = url.pathname + url.search + url.hash;
      return needsFix(relative) ? new URL(fix(relative), location.origin) : url;
    }
    return typeof url === 'string' ? fix(url) : url;
  }

  document.addEventListener('click', function (event) {
    if (event.defaultPrevented || event.button !== 0) return;
    var node = event.target;
    var anchor = node && node.closest ? node.closest('a[href]') : null;
    if (!anchor || anchor.hasAttribute('download')) return;
    var href = anchor.getAttribute('href');
    if (!needsFix(href)) return;

    event.preventDefault();
    var target = new URL(fix(href), location.href).href;
    var frame = anchor.getAttribute('target');
    var newTab = event.ctrlKey || event.metaKey || event.shiftKey ||
      (frame && frame !== '_self' && frame !== '_top' && frame !== '_parent');
    if (newTab) {
      window.open(target, frame && frame !== '_self' ? frame : '_blank');
    } else {
      location.assign(target);
    }
  }, true);

  ['pushState', 'replaceState'].forEach(function (name) {
    var original = history[name];
    history[name] = function (state, title, url) {
      if (arguments.length > 2 && url != null) {
        return original.call(this, state, title, fixAny(url));
      }
      return original.apply(this, arguments);
    };
  });

  var originalOpen = window.open;
  window.open = function () {
    var args = Array.prototype.slice.call(arguments);
    if (args.length > 0 && args[0] != null) args[0] = fixAny(args[0]);
    return originalOpen.apply(this, args);
  };

  function fixForm(form) {
    var action = form.getAttribute('action');
    if (needsFix(action)) form.setAttribute('action', fix(action));
  }

  document.addEventListener('submit', function (event) {
    if (event.target && event.target.tagName === 'FORM') fixForm(event.target);
  }, true);

  var originalSubmit = HTMLFormElement.prototype.submit;
  HTMLFormElement.prototype.submit = function () {
    fixForm(this);
    return originalSubmit.call(this);
  };

  function fixCurrentEntry() {
    if (needsFix(location.pathname)) {
      location.replace(fix(location.pathname) + location.search + location.hash);
    }
  }

  window.addEventListener('popstate', fixCurrentEntry);
  window.addEventListener('pageshow', function (event) {
    if (event.persisted) fixCurrentEntry();
  });
})();"#;

/// Schemes and reference forms the fixup rule never touches
const SKIPPED_PREFIXES: &[&str] = &["//", "mailto:", "tel:", "javascript:", "data:", "blob:", "#", "?"];

/// True if `url` is a root-relative reference that escapes the scope
pub fn needs_fixup(url: &str, scope: &Scope) -> bool {
    if !url.starts_with('/') {
        return false;
    }

    let lower = url.to_ascii_lowercase();
    if SKIPPED_PREFIXES.iter().any(|prefix| lower.starts_with(prefix)) || is_absolute(url) {
        return false;
    }

    !scope.contains(url)
}

/// Apply the fixup rule
pub fn fix_url<'a>(url: &'a str, scope: &Scope) -> Cow<'a, str> {
    if needs_fixup(url, scope) {
        Cow::Owned(format!("{}{}", scope.base(), url))
    } else {
        Cow::Borrowed(url)
    }
}

fn is_absolute(url: &str) -> bool {
    match url.find(':') {
        Some(idx) => {
            let scheme = &url[..idx];
            !scheme.is_empty()
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// True if the headers describe an HTML document
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

/// True if the body carries a content coding other than `identity`
pub fn is_encoded(headers: &HeaderMap) -> bool {
    headers.get_all(CONTENT_ENCODING).iter().any(|v| {
        v.to_str()
            .map(|coding| {
                coding
                    .split(',')
                    .map(str::trim)
                    .any(|c| !c.is_empty() && !c.eq_ignore_ascii_case("identity"))
            })
            .unwrap_or(true)
    })
}

/// Injects the fixup script into HTML documents
pub struct NavigationInjector {
    scope: Scope,
    script: String,
}

impl NavigationInjector {
    pub fn new(scope: Scope) -> Self {
        let script = render_script(&scope);
        Self { scope, script }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Script body (without the surrounding tag)
    pub fn script(&self) -> &str {
        &self.script
    }

    fn script_tag(&self) -> String {
        format!("<script>{}</script>", self.script)
    }

    /// Insert the script after `<head>`, or after `<html>` inside a synthesized head
    pub fn inject(&self, html: &[u8]) -> Result<Bytes> {
        let (offset, insertion) = if let Some(end) = find_open_tag_end(html, b"head") {
            (end, self.script_tag())
        } else if let Some(end) = find_open_tag_end(html, b"html") {
            (end, format!("<head>{}</head>", self.script_tag()))
        } else {
            return Err(AgentError::InjectionSkipped("no <head> or <html> tag"));
        };

        let mut out = BytesMut::with_capacity(html.len() + insertion.len());
        out.extend_from_slice(&html[..offset]);
        out.extend_from_slice(insertion.as_bytes());
        out.extend_from_slice(&html[offset..]);
        Ok(out.freeze())
    }

    /// Inject into an HTML response; anything else is returned untouched
    pub fn inject_response(&self, response: Response<Bytes>) -> Response<Bytes> {
        if !is_html(response.headers()) {
            return response;
        }
        if is_encoded(response.headers()) {
            debug!("{}", AgentError::InjectionSkipped("encoded body"));
            return response;
        }

        let (mut parts, body) = response.into_parts();
        match self.inject(&body) {
            Ok(injected) => {
                parts
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(injected.len()));
                Response::from_parts(parts, injected)
            }
            Err(e) => {
                debug!("{}", e);
                Response::from_parts(parts, body)
            }
        }
    }
}

fn render_script(scope: &Scope) -> String {
    let literal = serde_json::to_string(scope.as_str())
        .unwrap_or_else(|_| "\"/\"".to_string())
        .replace("</", "<\\/");
    NAVIGATION_SCRIPT_TEMPLATE.replace(SCOPE_PLACEHOLDER, &literal)
}

/// Byte offset just past the `>` of the first `<name ...>` opening tag
fn find_open_tag_end(html: &[u8], name: &[u8]) -> Option<usize> {
    let mut start = 0;
    while let Some(pos) = find_ci(&html[start..], b"<") {
        let tag_start = start + pos;
        let after_lt = tag_start + 1;
        let candidate = &html[after_lt..];

        if candidate.len() >= name.len() && candidate[..name.len()].eq_ignore_ascii_case(name) {
            let after_name = after_lt + name.len();
            match html.get(after_name) {
                Some(b'>') => return Some(after_name + 1),
                Some(c) if c.is_ascii_whitespace() || *c == b'/' => {
                    return find_ci(&html[after_name..], b">").map(|gt| after_name + gt + 1);
                }
                _ => {}
            }
        }
        start = after_lt;
    }
    None
}

fn find_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}
