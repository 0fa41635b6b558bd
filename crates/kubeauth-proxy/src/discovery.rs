//! Port discovery from the proxy's startup output

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Split};
use tracing::{debug, warn};

use crate::error::{AuthProxyError, Result};

/// Startup line printed by the proxy once it is listening
static STARTING_TO_SERVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)starting to serve on (?P<address>.+)").expect("valid startup regex")
});

/// Newline-delimited output of a child process
///
/// Bytes that are not valid UTF-8 are replaced rather than rejected, so only
/// real I/O failures surface as errors. A trailing `\r` is stripped.
#[derive(Debug)]
pub struct OutputLines<R> {
    segments: Split<R>,
}

impl<R: AsyncBufRead + Unpin> OutputLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            segments: reader.split(b'\n'),
        }
    }

    /// Next line, or `None` at end of stream
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let Some(mut bytes) = self.segments.next_segment().await? else {
            return Ok(None);
        };
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Scans a line stream for the proxy's "starting to serve" announcement
#[derive(Debug, Clone)]
pub struct PortDiscovery {
    pattern: Regex,
}

impl PortDiscovery {
    pub fn new() -> Self {
        Self {
            pattern: STARTING_TO_SERVE.clone(),
        }
    }

    /// Use a different matcher; it must capture an `address` group
    pub fn with_pattern(pattern: Regex) -> Self {
        Self { pattern }
    }

    /// Port announced by `line`, if it is a startup line with a usable address
    pub fn match_line(&self, line: &str) -> Option<u16> {
        let address = self.pattern.captures(line)?.name("address")?.as_str();
        match extract_port(address) {
            Some(port) => Some(port),
            None => {
                warn!(address, "Startup line matched but carried no port");
                None
            }
        }
    }

    /// Consume lines until the startup announcement and return its port
    ///
    /// `on_found` runs once, right before returning. Lines after the match are
    /// left in `lines` for the caller.
    pub async fn discover<R, F>(&self, lines: &mut OutputLines<R>, on_found: F) -> Result<u16>
    where
        R: AsyncBufRead + Unpin,
        F: FnOnce(u16),
    {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(port) = self.match_line(&line) {
                        on_found(port);
                        return Ok(port);
                    }
                    debug!(line = %line, "Skipping proxy startup output");
                }
                Ok(None) => return Err(AuthProxyError::StreamClosed),
                Err(e) => return Err(AuthProxyError::Disconnected(e.to_string())),
            }
        }
    }
}

impl Default for PortDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Port from an address such as `127.0.0.1:8443`, `[::1]:8443` or `http://host:8443/`
pub fn extract_port(address: &str) -> Option<u16> {
    let address = address.trim().trim_end_matches('/');
    let (_, port) = address.rsplit_once(':')?;
    port.parse().ok()
}
