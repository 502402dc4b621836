//! HTTP rule engine.
//!
//! Rules run in configuration order. Header additions fall through;
//! everything else terminates the pass. The caller turns the verdict
//! into the actual response and session outcome so the engine stays
//! reusable between the frontend and backend stages.

use tracing::trace;

use crate::proto::h1::headers;
use crate::proxy::{HttpRule, Redirect, RedirectKind, RuleAct};
use crate::session::Session;

/// Terminal outcome of one pass over a rule list.
pub enum Verdict {
    /// Fell off the end of the list or hit an explicit allow.
    Allow,
    Deny,
    Tarpit,
    Auth { realm: String, proxy: bool },
    Redirect(Redirect),
    /// A header rewrite did not fit in the buffer.
    RewriteFailed,
}

/// Apply a rule list against the current request.
pub fn apply_http_req_rules(s: &mut Session, rules: &[HttpRule]) -> Verdict {
    let src = s.client_addr();
    for rule in rules {
        let meth = s.txn.meth.clone();
        let uri = s.txn.uri.clone();
        let hit = rule
            .cond
            .as_ref()
            .map(|c| c.eval(src, meth.as_ref(), uri.as_deref()))
            .unwrap_or(true);
        if !hit {
            continue;
        }
        match rule.action {
            RuleAct::Allow => return Verdict::Allow,
            RuleAct::Deny => return Verdict::Deny,
            RuleAct::Tarpit => return Verdict::Tarpit,
            RuleAct::Auth { ref realm, ref proxy } => {
                return Verdict::Auth {
                    realm: realm.clone(),
                    proxy: *proxy,
                }
            }
            RuleAct::Redirect(ref r) => return Verdict::Redirect(r.clone()),
            RuleAct::AddHdr { ref name, ref value } => {
                if !add_req_header(s, name, value) {
                    return Verdict::RewriteFailed;
                }
            }
            RuleAct::SetHdr { ref name, ref value } => {
                if !set_req_header(s, name, value) {
                    return Verdict::RewriteFailed;
                }
            }
        }
    }
    Verdict::Allow
}

/// Append one `name: value` line to the request.
pub fn add_req_header(s: &mut Session, name: &str, value: &str) -> bool {
    let mut line = Vec::with_capacity(name.len() + value.len() + 2);
    line.extend_from_slice(name.as_bytes());
    line.extend_from_slice(b": ");
    line.extend_from_slice(value.as_bytes());
    let crate::session::Session {
        ref mut req,
        ref mut txn,
        ..
    } = *s;
    headers::append_header(&line, &mut req.buf, &mut txn.hdr_idx, &mut txn.req).is_some()
}

/// Remove every occurrence of `name` then append one synthesized value.
pub fn set_req_header(s: &mut Session, name: &str, value: &str) -> bool {
    trace!("set-header {}: {}", name, value);
    let lname = name.to_ascii_lowercase();
    {
        let crate::session::Session {
            ref mut req,
            ref mut txn,
            ..
        } = *s;
        let mut from = None;
        loop {
            let input = req.buf.input_contiguous().to_vec();
            let ctx = match headers::find_header(lname.as_bytes(), &input, &txn.hdr_idx, from) {
                Some(ctx) => ctx,
                None => break,
            };
            let (_, resume) =
                headers::remove_header(&ctx, &mut req.buf, &mut txn.hdr_idx, &mut txn.req);
            from = Some(resume);
        }
    }
    add_req_header(s, name, value)
}

/// Build the Location for a redirect rule against the request URI.
pub fn redirect_location(rule: &RedirectKind, uri: Option<&str>) -> String {
    match rule {
        RedirectKind::Location(loc) => loc.clone(),
        RedirectKind::Prefix(pfx) => {
            let mut out = pfx.clone();
            match uri {
                Some(path) if path.starts_with('/') => out.push_str(path),
                _ => out.push('/'),
            }
            out
        }
    }
}
