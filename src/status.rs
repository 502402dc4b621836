//! Synthesized responses the proxy emits on its own behalf.
//!
//! These are complete, self-describing HTTP/1.0 messages carrying tiny HTML
//! bodies; they are injected verbatim on the client channel and the session
//! then runs its normal close path.

/// Status codes the engine may synthesize by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrStatus {
    Ok200,
    BadRequest400,
    Forbidden403,
    RequestTimeout408,
    ServerError500,
    BadGateway502,
    Unavailable503,
    GatewayTimeout504,
}

impl ErrStatus {
    pub fn code(&self) -> u16 {
        match *self {
            ErrStatus::Ok200 => 200,
            ErrStatus::BadRequest400 => 400,
            ErrStatus::Forbidden403 => 403,
            ErrStatus::RequestTimeout408 => 408,
            ErrStatus::ServerError500 => 500,
            ErrStatus::BadGateway502 => 502,
            ErrStatus::Unavailable503 => 503,
            ErrStatus::GatewayTimeout504 => 504,
        }
    }

    /// The raw message to put on the wire.
    pub fn message(&self) -> &'static [u8] {
        match *self {
            ErrStatus::Ok200 => HTTP_200,
            ErrStatus::BadRequest400 => HTTP_400,
            ErrStatus::Forbidden403 => HTTP_403,
            ErrStatus::RequestTimeout408 => HTTP_408,
            ErrStatus::ServerError500 => HTTP_500,
            ErrStatus::BadGateway502 => HTTP_502,
            ErrStatus::Unavailable503 => HTTP_503,
            ErrStatus::GatewayTimeout504 => HTTP_504,
        }
    }
}

pub const HTTP_200: &[u8] = b"HTTP/1.0 200 OK\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>200 OK</h1>\nService ready.\n</body></html>\n";

pub const HTTP_400: &[u8] = b"HTTP/1.0 400 Bad request\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>400 Bad request</h1>\nYour browser sent an invalid request.\n</body></html>\n";

pub const HTTP_403: &[u8] = b"HTTP/1.0 403 Forbidden\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>403 Forbidden</h1>\nRequest forbidden by administrative rules.\n</body></html>\n";

pub const HTTP_408: &[u8] = b"HTTP/1.0 408 Request Time-out\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>408 Request Time-out</h1>\nYour browser didn't send a complete request in time.\n</body></html>\n";

pub const HTTP_500: &[u8] = b"HTTP/1.0 500 Server Error\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>500 Server Error</h1>\nAn internal server error occurred.\n</body></html>\n";

pub const HTTP_502: &[u8] = b"HTTP/1.0 502 Bad Gateway\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>502 Bad Gateway</h1>\nThe server returned an invalid or incomplete response.\n</body></html>\n";

pub const HTTP_503: &[u8] = b"HTTP/1.0 503 Service Unavailable\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>503 Service Unavailable</h1>\nNo server is available to handle this request.\n</body></html>\n";

pub const HTTP_504: &[u8] = b"HTTP/1.0 504 Gateway Time-out\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>504 Gateway Time-out</h1>\nThe server didn't respond in time.\n</body></html>\n";

/// Build a 401/407 challenge for an auth rule.
pub fn auth_challenge(realm: &str, proxy: bool) -> Vec<u8> {
    let (code, reason, hdr) = if proxy {
        (407, "Unauthorized", "Proxy-Authenticate")
    } else {
        (401, "Unauthorized", "WWW-Authenticate")
    };
    let body = "<html><body><h1>401 Unauthorized</h1>\nYou need a valid user and password to access this content.\n</body></html>\n";
    let mut out = Vec::with_capacity(256);
    let mut code_buf = itoa::Buffer::new();
    out.extend_from_slice(b"HTTP/1.0 ");
    out.extend_from_slice(code_buf.format(code).as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(reason.as_bytes());
    out.extend_from_slice(b"\r\nCache-Control: no-cache\r\nConnection: close\r\nContent-Type: text/html\r\n");
    out.extend_from_slice(hdr.as_bytes());
    out.extend_from_slice(b": Basic realm=\"");
    out.extend_from_slice(realm.as_bytes());
    out.extend_from_slice(b"\"\r\n\r\n");
    out.extend_from_slice(body.as_bytes());
    out
}

/// Build a redirect response. `keep_alive` picks `Connection: keep-alive`
/// so the client can reuse the socket for its next request.
pub fn redirect(code: u16, location: &str, set_cookie: Option<&str>, keep_alive: bool) -> Vec<u8> {
    let reason = match code {
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        _ => "Found",
    };
    let mut out = Vec::with_capacity(256);
    let mut code_buf = itoa::Buffer::new();
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(code_buf.format(code).as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(reason.as_bytes());
    out.extend_from_slice(b"\r\nCache-Control: no-cache\r\nContent-Length: 0\r\nLocation: ");
    out.extend_from_slice(location.as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(cookie) = set_cookie {
        out.extend_from_slice(b"Set-Cookie: ");
        out.extend_from_slice(cookie.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if keep_alive {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_messages_are_complete_http() {
        for status in [
            ErrStatus::Ok200,
            ErrStatus::BadRequest400,
            ErrStatus::Forbidden403,
            ErrStatus::RequestTimeout408,
            ErrStatus::ServerError500,
            ErrStatus::BadGateway502,
            ErrStatus::Unavailable503,
            ErrStatus::GatewayTimeout504,
        ] {
            let msg = status.message();
            assert!(msg.starts_with(b"HTTP/1.0 "));
            let code = std::str::from_utf8(&msg[9..12]).unwrap();
            assert_eq!(code.parse::<u16>().unwrap(), status.code());
            let text = std::str::from_utf8(msg).unwrap();
            assert!(text.contains("\r\n\r\n"));
            assert!(text.contains("Connection: close"));
        }
    }

    #[test]
    fn challenge_names_the_right_header() {
        let www = auth_challenge("site", false);
        assert!(std::str::from_utf8(&www).unwrap().contains("WWW-Authenticate: Basic realm=\"site\""));
        let prx = auth_challenge("site", true);
        let prx = std::str::from_utf8(&prx).unwrap();
        assert!(prx.starts_with("HTTP/1.0 407"));
        assert!(prx.contains("Proxy-Authenticate"));
    }

    #[test]
    fn redirect_shapes_connection_header() {
        let ka = redirect(301, "https://x/", None, true);
        let ka = std::str::from_utf8(&ka).unwrap();
        assert!(ka.starts_with("HTTP/1.1 301 Moved Permanently"));
        assert!(ka.contains("Location: https://x/"));
        assert!(ka.contains("Connection: keep-alive"));
        assert!(ka.contains("Content-Length: 0"));

        let clo = redirect(302, "/y", Some("SRV=1; path=/"), false);
        let clo = std::str::from_utf8(&clo).unwrap();
        assert!(clo.contains("Set-Cookie: SRV=1; path=/"));
        assert!(clo.contains("Connection: close"));
    }
}
