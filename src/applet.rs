//! Embedded applets: endpoints served by the process itself.
//!
//! An applet replaces the server side of a session. It consumes the
//! request channel's scheduled bytes and produces response bytes on the
//! response channel, with no syscalls involved; the rest of the pipeline
//! (analysers, forwarding, close choreography) is unchanged.

use std::rc::Rc;

use crate::channel::Channel;
use crate::clock::Ms;
use crate::proxy::{AdminState, Proxy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppletStatus {
    /// More to do; call again when bytes move.
    Cont,
    /// Response fully produced; behave like a server that closed.
    Done,
}

pub trait Applet {
    fn name(&self) -> &'static str;

    /// Consume from `ob` (bytes the session scheduled toward us) and
    /// produce into `ib` (bytes going back to the client).
    fn run(&mut self, ob: &mut Channel, ib: &mut Channel, now: Ms) -> AppletStatus;
}

/// Outcome code embedded in the stats redirect (`;st=<code>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsResult {
    Deny,
    Done,
    Errp,
    Excd,
    None,
    Part,
    Unkn,
}

impl StatsResult {
    pub fn as_str(&self) -> &'static str {
        match *self {
            StatsResult::Deny => "DENY",
            StatsResult::Done => "DONE",
            StatsResult::Errp => "ERRP",
            StatsResult::Excd => "EXCD",
            StatsResult::None => "NONE",
            StatsResult::Part => "PART",
            StatsResult::Unkn => "UNKN",
        }
    }
}

/// Maximum POST body accepted before answering EXCD.
const STATS_POST_MAX: usize = 4096;

/// The stats admin applet: accepts the dashboard's POST form and flips
/// server administrative states.
pub struct StatsApplet {
    pub uri_prefix: String,
    pub admin: bool,
    pub backends: Vec<Rc<Proxy>>,
    inbuf: Vec<u8>,
}

impl StatsApplet {
    pub fn new(uri_prefix: &str, admin: bool, backends: Vec<Rc<Proxy>>) -> StatsApplet {
        StatsApplet {
            uri_prefix: uri_prefix.to_owned(),
            admin,
            backends,
            inbuf: Vec::new(),
        }
    }

    fn respond_redirect(&self, ib: &mut Channel, result: StatsResult) {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(b"HTTP/1.1 303 See Other\r\nCache-Control: no-cache\r\nContent-Length: 0\r\nConnection: close\r\nLocation: ");
        out.extend_from_slice(self.uri_prefix.as_bytes());
        out.extend_from_slice(b";st=");
        out.extend_from_slice(result.as_str().as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        ib.buf.put_slice(&out);
    }

    fn respond_page(&self, ib: &mut Channel) {
        ib.buf.put_slice(crate::status::HTTP_200);
    }

    /// Apply the parsed form against the configured backends.
    pub fn apply_form(&self, form: &StatsForm) -> StatsResult {
        if !self.admin {
            return StatsResult::Deny;
        }
        let action = match form.action.as_deref() {
            Some(a) => a,
            None => return StatsResult::None,
        };
        let target = match form.backend.as_deref() {
            Some(b) => b,
            None => return StatsResult::None,
        };
        let new_state = match action {
            "disable" => AdminState::Disabled,
            "enable" | "start" => AdminState::Ready,
            "stop" | "shutdown" => AdminState::Stopped,
            _ => return StatsResult::Unkn,
        };
        let be = match self.backends.iter().find(|p| p.name == target) {
            Some(be) => be,
            None => return StatsResult::None,
        };
        if form.servers.is_empty() {
            return StatsResult::None;
        }
        let mut hit = 0;
        for name in &form.servers {
            if let Some(srv) = be.servers.iter().find(|s| &s.name == name) {
                srv.admin.set(new_state);
                hit += 1;
            }
        }
        if hit == form.servers.len() {
            StatsResult::Done
        } else if hit > 0 {
            StatsResult::Part
        } else {
            StatsResult::None
        }
    }
}

impl Applet for StatsApplet {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn run(&mut self, ob: &mut Channel, ib: &mut Channel, _now: Ms) -> AppletStatus {
        // drain whatever the session scheduled toward us
        let pending = ob.buf.output_to_vec();
        if !pending.is_empty() {
            ob.buf.fast_delete(pending.len());
            self.inbuf.extend_from_slice(&pending);
        }
        if self.inbuf.len() > STATS_POST_MAX + 1024 {
            self.respond_redirect(ib, StatsResult::Excd);
            return AppletStatus::Done;
        }

        let head_end = match find_head_end(&self.inbuf) {
            Some(at) => at,
            None => return AppletStatus::Cont,
        };
        let head = &self.inbuf[..head_end];
        if !head.starts_with(b"POST ") {
            self.respond_page(ib);
            return AppletStatus::Done;
        }
        let clen = content_length(head).unwrap_or(0);
        if clen > STATS_POST_MAX {
            self.respond_redirect(ib, StatsResult::Excd);
            return AppletStatus::Done;
        }
        let body = &self.inbuf[head_end..];
        if body.len() < clen {
            return AppletStatus::Cont;
        }
        let result = match parse_stats_form(&body[..clen]) {
            Ok(form) => self.apply_form(&form),
            Err(()) => StatsResult::Errp,
        };
        self.respond_redirect(ib, result);
        AppletStatus::Done
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(head: &[u8]) -> Option<usize> {
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() > 15 && line[..15].eq_ignore_ascii_case(b"content-length:") {
            return std::str::from_utf8(&line[15..]).ok()?.trim().parse().ok();
        }
    }
    None
}

/// Decoded stats POST form.
#[derive(Debug, Default)]
pub struct StatsForm {
    pub backend: Option<String>,
    pub action: Option<String>,
    pub servers: Vec<String>,
}

/// Parse `application/x-www-form-urlencoded` with keys `b`, `action` and
/// repeating `s`.
pub fn parse_stats_form(body: &[u8]) -> Result<StatsForm, ()> {
    let mut form = StatsForm::default();
    for pair in body.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let eq = pair.iter().position(|&b| b == b'=').ok_or(())?;
        let key = url_decode(&pair[..eq])?;
        let val = url_decode(&pair[eq + 1..])?;
        match key.as_str() {
            "b" => form.backend = Some(val),
            "action" => form.action = Some(val),
            "s" => form.servers.push(val),
            _ => {} // unknown keys are ignored, the dashboard may grow
        }
    }
    Ok(form)
}

fn url_decode(raw: &[u8]) -> Result<String, ()> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = hex_val(*raw.get(i + 1).ok_or(())?)?;
                let lo = hex_val(*raw.get(i + 2).ok_or(())?)?;
                out.push((hi << 4) | lo);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).map_err(|_| ())
}

fn hex_val(b: u8) -> Result<u8, ()> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{MemGateway, PxMode, Server, ServerAddr};

    fn backend_with_servers() -> Rc<Proxy> {
        let mut be = Proxy::new("app", PxMode::Http);
        be.servers = vec![
            Server::new("s1", ServerAddr::Mem(MemGateway::new())),
            Server::new("s2", ServerAddr::Mem(MemGateway::new())),
        ];
        Rc::new(be)
    }

    #[test]
    fn form_parses_repeated_servers() {
        let form = parse_stats_form(b"b=app&action=disable&s=s1&s=s2").unwrap();
        assert_eq!(form.backend.as_deref(), Some("app"));
        assert_eq!(form.action.as_deref(), Some("disable"));
        assert_eq!(form.servers, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn form_decodes_percent_and_plus() {
        let form = parse_stats_form(b"b=my+app&action=enable&s=srv%2f1").unwrap();
        assert_eq!(form.backend.as_deref(), Some("my app"));
        assert_eq!(form.servers, vec!["srv/1".to_string()]);
    }

    #[test]
    fn malformed_pairs_are_rejected(){
        assert!(parse_stats_form(b"noequals").is_err());
        assert!(parse_stats_form(b"b=%zz").is_err());
    }

    #[test]
    fn actions_flip_admin_state() {
        let be = backend_with_servers();
        let app = StatsApplet::new("/stats", true, vec![be.clone()]);
        let form = parse_stats_form(b"b=app&action=disable&s=s1").unwrap();
        assert_eq!(app.apply_form(&form), StatsResult::Done);
        assert_eq!(be.servers[0].admin.get(), AdminState::Disabled);
        assert_eq!(be.servers[1].admin.get(), AdminState::Ready);

        let form = parse_stats_form(b"b=app&action=enable&s=s1").unwrap();
        assert_eq!(app.apply_form(&form), StatsResult::Done);
        assert_eq!(be.servers[0].admin.get(), AdminState::Ready);
    }

    #[test]
    fn partial_and_unknown_results() {
        let be = backend_with_servers();
        let app = StatsApplet::new("/stats", true, vec![be.clone()]);
        let form = parse_stats_form(b"b=app&action=stop&s=s1&s=ghost").unwrap();
        assert_eq!(app.apply_form(&form), StatsResult::Part);
        let form = parse_stats_form(b"b=app&action=reboot&s=s1").unwrap();
        assert_eq!(app.apply_form(&form), StatsResult::Unkn);
        let form = parse_stats_form(b"b=ghost&action=stop&s=s1").unwrap();
        assert_eq!(app.apply_form(&form), StatsResult::None);
    }

    #[test]
    fn non_admin_is_denied() {
        let be = backend_with_servers();
        let app = StatsApplet::new("/stats", false, vec![be]);
        let form = parse_stats_form(b"b=app&action=disable&s=s1").unwrap();
        assert_eq!(app.apply_form(&form), StatsResult::Deny);
    }

    #[test]
    fn run_waits_for_full_body_then_redirects() {
        let be = backend_with_servers();
        let mut app = StatsApplet::new("/stats", true, vec![be.clone()]);
        let mut ob = Channel::new(1024);
        let mut ib = Channel::new(1024);

        let req = b"POST /stats HTTP/1.1\r\nHost: x\r\nContent-Length: 25\r\n\r\n";
        ob.buf.put_slice(req);
        ob.buf.advance(req.len());
        assert_eq!(app.run(&mut ob, &mut ib, 0), AppletStatus::Cont);

        let body = b"b=app&acti";
        ob.buf.put_slice(body);
        ob.buf.advance(body.len());
        assert_eq!(app.run(&mut ob, &mut ib, 0), AppletStatus::Cont);

        let tail = b"on=disable&s=s2";
        ob.buf.put_slice(tail);
        ob.buf.advance(tail.len());
        assert_eq!(app.run(&mut ob, &mut ib, 0), AppletStatus::Done);
        assert_eq!(be.servers[1].admin.get(), AdminState::Disabled);
        let rsp = ib.buf.input_contiguous();
        let rsp = std::str::from_utf8(rsp).unwrap();
        assert!(rsp.starts_with("HTTP/1.1 303 See Other"));
        assert!(rsp.contains("Location: /stats;st=DONE"));
    }
}
