use std::cell::RefCell;
use std::rc::Rc;

use lol_html::html_content::ContentType;
use lol_html::{element, text, HtmlRewriter, Settings};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::warn;
use url::Url;

/// How `<script>` content is handled. `Strip` removes scripts outright and
/// surfaces `<noscript>` fallbacks; `Rewrite` keeps scripts and reroutes
/// the literal `fetch(...)` / `new WebSocket(...)` string arguments it can
/// statically detect.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ScriptPolicy {
    #[default]
    Strip,
    Rewrite,
}

pub const PROXY_ROUTE: &str = "/proxy?url=";
pub const WS_ROUTE: &str = "/ws?url=";

// encodeURIComponent-style set: everything except unreserved characters.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Proxy-relative reference for an absolute target.
pub fn proxy_route(url: &Url) -> String {
    let route = match url.scheme() {
        "ws" | "wss" => WS_ROUTE,
        _ => PROXY_ROUTE,
    };
    format!("{route}{}", utf8_percent_encode(url.as_str(), COMPONENT))
}

/// Rewrite one attribute value against `base`. Returns `None` when the
/// value must be left alone: inert schemes, fragments, values that are
/// already proxy-relative (keeps rewriting idempotent), and anything that
/// fails URL resolution (fail-soft for rendering).
pub fn rewrite_url_value(value: &str, base: &Url) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || v.starts_with('#') {
        return None;
    }
    let lower = v.to_ascii_lowercase();
    if lower.starts_with("javascript:")
        || lower.starts_with("data:")
        || lower.starts_with("blob:")
        || lower.starts_with("mailto:")
    {
        return None;
    }
    if v.starts_with(PROXY_ROUTE) || v.starts_with(WS_ROUTE) {
        return None;
    }
    let resolved = base.join(v).ok()?;
    match resolved.scheme() {
        "http" | "https" | "ws" | "wss" => Some(proxy_route(&resolved)),
        _ => None,
    }
}

/// Rewrite a `srcset` value: comma-separated URL tokens, each optionally
/// followed by a width/density descriptor that must survive untouched.
pub fn rewrite_srcset_value(srcset: &str, base: &Url) -> String {
    srcset
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            let mut parts = entry.splitn(2, char::is_whitespace);
            let url_token = parts.next().unwrap_or_default();
            let descriptor = parts.next().map(str::trim).unwrap_or_default();
            let rewritten = rewrite_url_value(url_token, base)
                .unwrap_or_else(|| url_token.to_string());
            if descriptor.is_empty() {
                rewritten
            } else {
                format!("{rewritten} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rewrite `url(...)` tokens and quoted `@import` targets in CSS source.
/// Used for `<style>` blocks, `style=` attributes, and standalone
/// `text/css` bodies.
pub fn rewrite_css(css: &str, base: &Url) -> String {
    // ASCII lowercasing keeps byte offsets aligned with the original, so
    // one lowered copy serves every search below.
    let lower = css.to_ascii_lowercase();
    let mut out = String::with_capacity(css.len());
    let mut pos = 0;
    loop {
        let url_pos = lower[pos..].find("url(").map(|i| pos + i);
        let import_pos = find_quoted_import(&lower, pos);
        match (url_pos, import_pos) {
            (None, None) => break,
            (Some(u), i) if i.map(|i| u < i).unwrap_or(true) => {
                let inner_start = u + 4;
                let Some(close) = css[inner_start..].find(')') else {
                    break;
                };
                out.push_str(&css[pos..inner_start]);
                let raw = css[inner_start..inner_start + close].trim();
                let (quote, unquoted) = strip_css_quotes(raw);
                let rewritten = rewrite_url_value(unquoted, base)
                    .unwrap_or_else(|| unquoted.to_string());
                out.push_str(quote);
                out.push_str(&rewritten);
                out.push_str(quote);
                pos = inner_start + close;
            }
            (_, Some(i)) => {
                // `@import "..."` / `@import '...'`; the url(...) form is
                // caught by the branch above.
                let quote = css.as_bytes()[i] as char;
                let Some(close) = css[i + 1..].find(quote) else {
                    break;
                };
                out.push_str(&css[pos..=i]);
                let target = &css[i + 1..i + 1 + close];
                let rewritten =
                    rewrite_url_value(target, base).unwrap_or_else(|| target.to_string());
                out.push_str(&rewritten);
                pos = i + 1 + close;
            }
            _ => break,
        }
    }
    out.push_str(&css[pos..]);
    out
}

// Position of the opening quote of an `@import "..."` directive at or
// after `from`, if any.
fn find_quoted_import(lower: &str, from: usize) -> Option<usize> {
    let mut offset = from;
    while let Some(found) = lower[offset..].find("@import") {
        let after = offset + found + "@import".len();
        let trimmed = lower[after..].trim_start();
        if trimmed.starts_with('"') || trimmed.starts_with('\'') {
            return Some(after + (lower[after..].len() - trimmed.len()));
        }
        offset = after;
    }
    None
}

fn strip_css_quotes(raw: &str) -> (&'static str, &str) {
    if let Some(inner) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        ("\"", inner)
    } else if let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        ("'", inner)
    } else {
        ("", raw)
    }
}

/// Rewrite the `url=` portion of a `<meta http-equiv=refresh>` content
/// value, preserving the numeric delay.
fn rewrite_refresh_content(content: &str, base: &Url) -> Option<String> {
    let lower = content.to_ascii_lowercase();
    let url_pos = lower.find("url=")?;
    let prefix = &content[..url_pos + 4];
    let target = content[url_pos + 4..].trim().trim_matches(|c| c == '"' || c == '\'');
    let rewritten = rewrite_url_value(target, base)?;
    Some(format!("{prefix}{rewritten}"))
}

/// Statically rewrite `fetch("...")` and `new WebSocket("...")` literal
/// arguments in script source. Only quoted string literals immediately
/// following the call are touched; computed URLs stay as-is (non-goal).
pub fn rewrite_script_source(src: &str, base: &Url) -> String {
    let ws_base = websocket_base(base);
    let out = rewrite_call_literals(src, "fetch(", base);
    rewrite_call_literals(&out, "new WebSocket(", &ws_base)
}

// Base URL with the scheme flipped to ws/wss, so relative WebSocket
// literals resolve to a relayable target.
fn websocket_base(base: &Url) -> Url {
    let mut ws = base.clone();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    // set_scheme only fails for special-scheme crossings that cannot
    // happen for http(s) -> ws(s).
    let _ = ws.set_scheme(scheme);
    ws
}

fn rewrite_call_literals(src: &str, needle: &str, base: &Url) -> String {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(pos) = rest.find(needle) {
        let after_call = pos + needle.len();
        out.push_str(&rest[..after_call]);
        rest = &rest[after_call..];

        let ws_len = rest.len() - rest.trim_start().len();
        out.push_str(&rest[..ws_len]);
        rest = &rest[ws_len..];

        let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            continue;
        };
        let Some(end) = rest[1..].find(quote) else {
            continue;
        };
        let literal = &rest[1..1 + end];
        let rewritten =
            rewrite_url_value(literal, base).unwrap_or_else(|| literal.to_string());
        out.push(quote);
        out.push_str(&rewritten);
        out.push(quote);
        rest = &rest[1 + end + 1..];
    }
    out.push_str(rest);
    out
}

const URL_ATTRS: [&str; 5] = ["href", "src", "action", "data-src", "data-original"];

/// Stream the HTML body through `lol_html`, rewriting every navigable or
/// fetchable reference to a proxy-relative one. Returns `None` if the
/// rewriter itself fails; the caller then forwards the original body
/// unmodified (fail-soft for rendering, never for fetching).
pub fn rewrite_html(input: &[u8], base: &Url, policy: ScriptPolicy) -> Option<Vec<u8>> {
    let mut handlers = Vec::new();

    // <base> would re-anchor relative resolution away from the proxy.
    handlers.push(element!("base", |el| {
        el.remove();
        Ok(())
    }));

    for attr in URL_ATTRS {
        let base = base.clone();
        handlers.push(element!(format!("[{attr}]"), move |el| {
            if let Some(value) = el.get_attribute(attr) {
                if let Some(rewritten) = rewrite_url_value(&value, &base) {
                    el.set_attribute(attr, &rewritten)?;
                }
            }
            Ok(())
        }));
    }

    let srcset_base = base.clone();
    handlers.push(element!("[srcset]", move |el| {
        if let Some(value) = el.get_attribute("srcset") {
            el.set_attribute("srcset", &rewrite_srcset_value(&value, &srcset_base))?;
        }
        Ok(())
    }));

    let style_attr_base = base.clone();
    handlers.push(element!("[style]", move |el| {
        if let Some(value) = el.get_attribute("style") {
            el.set_attribute("style", &rewrite_css(&value, &style_attr_base))?;
        }
        Ok(())
    }));

    let refresh_base = base.clone();
    handlers.push(element!("meta[http-equiv]", move |el| {
        let is_refresh = el
            .get_attribute("http-equiv")
            .map(|v| v.trim().eq_ignore_ascii_case("refresh"))
            .unwrap_or(false);
        if is_refresh {
            if let Some(content) = el.get_attribute("content") {
                if let Some(rewritten) = rewrite_refresh_content(&content, &refresh_base) {
                    el.set_attribute("content", &rewritten)?;
                }
            }
        }
        Ok(())
    }));

    // Sub-resource integrity hashes no longer match once the body routes
    // through the proxy.
    handlers.push(element!("[integrity]", |el| {
        el.remove_attribute("integrity");
        Ok(())
    }));

    let style_base = base.clone();
    let style_buf: Rc<RefCell<String>> = Rc::new(RefCell::new(String::new()));
    handlers.push(text!("style", move |chunk| {
        style_buf.borrow_mut().push_str(chunk.as_str());
        if chunk.last_in_text_node() {
            let css = std::mem::take(&mut *style_buf.borrow_mut());
            // Raw-text content: Html keeps `>` and `&` verbatim where
            // Text would entity-escape them and break selectors.
            chunk.replace(&rewrite_css(&css, &style_base), ContentType::Html);
        } else {
            chunk.remove();
        }
        Ok(())
    }));

    match policy {
        ScriptPolicy::Strip => {
            handlers.push(element!("script", |el| {
                el.remove();
                Ok(())
            }));
            handlers.push(element!("noscript", |el| {
                el.remove_and_keep_content();
                Ok(())
            }));
            handlers.push(element!("[loading]", |el| {
                let lazy = el
                    .get_attribute("loading")
                    .map(|v| v.eq_ignore_ascii_case("lazy"))
                    .unwrap_or(false);
                if lazy {
                    el.remove_attribute("loading");
                }
                Ok(())
            }));
        }
        ScriptPolicy::Rewrite => {
            let script_base = base.clone();
            let script_buf: Rc<RefCell<String>> = Rc::new(RefCell::new(String::new()));
            handlers.push(text!("script", move |chunk| {
                script_buf.borrow_mut().push_str(chunk.as_str());
                if chunk.last_in_text_node() {
                    let src = std::mem::take(&mut *script_buf.borrow_mut());
                    chunk.replace(
                        &rewrite_script_source(&src, &script_base),
                        ContentType::Html,
                    );
                } else {
                    chunk.remove();
                }
                Ok(())
            }));
        }
    }

    let mut output = Vec::with_capacity(input.len());
    let result = (|| {
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: handlers,
                ..Settings::default()
            },
            |chunk: &[u8]| output.extend_from_slice(chunk),
        );
        rewriter.write(input)?;
        rewriter.end()
    })();

    match result {
        Ok(()) => Some(output),
        Err(err) => {
            warn!(%err, "html rewrite failed, passing body through");
            None
        }
    }
}
