//! Canned status responses emitted by the engine itself.
//!
//! These are byte-exact wire messages: errors carry a fixed HTML body
//! and close the connection, the interim 100 is the two-line minimum,
//! and redirect preambles end right where the Location value starts.
//! A proxy may override the error payloads per status code.

/// The interim response emitted for `Expect: 100-continue`.
pub const HTTP_100: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

const HTTP_200: &[u8] = b"HTTP/1.0 200 OK\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>200 OK</h1>\nService ready.\n</body></html>\n";

const HTTP_400: &[u8] = b"HTTP/1.0 400 Bad request\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>400 Bad request</h1>\nYour browser sent an invalid request.\n</body></html>\n";

const HTTP_403: &[u8] = b"HTTP/1.0 403 Forbidden\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>403 Forbidden</h1>\nRequest forbidden by administrative rules.\n</body></html>\n";

const HTTP_408: &[u8] = b"HTTP/1.0 408 Request Time-out\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>408 Request Time-out</h1>\nYour browser didn't send a complete request in time.\n</body></html>\n";

const HTTP_500: &[u8] = b"HTTP/1.0 500 Server Error\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>500 Server Error</h1>\nAn internal server error occurred.\n</body></html>\n";

const HTTP_502: &[u8] = b"HTTP/1.0 502 Bad Gateway\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>502 Bad Gateway</h1>\nThe server returned an invalid or incomplete response.\n</body></html>\n";

const HTTP_503: &[u8] = b"HTTP/1.0 503 Service Unavailable\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>503 Service Unavailable</h1>\nNo server is available to handle this request.\n</body></html>\n";

const HTTP_504: &[u8] = b"HTTP/1.0 504 Gateway Time-out\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>504 Gateway Time-out</h1>\nThe server didn't respond in time.\n</body></html>\n";

/// Returns the default canned payload for a status the engine emits.
pub fn error_message(status: u16) -> &'static [u8] {
    match status {
        200 => HTTP_200,
        400 => HTTP_400,
        403 => HTTP_403,
        408 => HTTP_408,
        500 => HTTP_500,
        502 => HTTP_502,
        503 => HTTP_503,
        504 => HTTP_504,
        _ => HTTP_500,
    }
}

/// Builds a 401 or 407 challenge with the realm spliced into the
/// authenticate header.
pub fn auth_challenge(realm: &str, proxy: bool) -> Vec<u8> {
    let (status, header) = if proxy {
        ("407 Unauthorized", "Proxy-Authenticate")
    } else {
        ("401 Unauthorized", "WWW-Authenticate")
    };
    format!(
        "HTTP/1.0 {}\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\
         Content-Type: text/html\r\n\
         {}: Basic realm=\"{}\"\r\n\
         \r\n\
         <html><body><h1>{}</h1>\n\
         You need a valid user and password to access this content.\n\
         </body></html>\n",
        status, header, realm, status
    )
    .into_bytes()
}

/// Start of a redirect response, up to and including `Location: `.
pub fn redirect_preamble(code: u16) -> &'static [u8] {
    match code {
        301 => b"HTTP/1.1 301 Moved Permanently\r\nContent-length: 0\r\nLocation: ",
        303 => b"HTTP/1.1 303 See Other\r\nCache-Control: no-cache\r\nContent-length: 0\r\nLocation: ",
        307 => {
            b"HTTP/1.1 307 Temporary Redirect\r\nCache-Control: no-cache\r\nContent-length: 0\r\nLocation: "
        }
        308 => b"HTTP/1.1 308 Permanent Redirect\r\nContent-length: 0\r\nLocation: ",
        _ => b"HTTP/1.1 302 Found\r\nCache-Control: no-cache\r\nContent-length: 0\r\nLocation: ",
    }
}
