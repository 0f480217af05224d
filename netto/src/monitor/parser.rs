// Line parser for the nettop accounting feed
//
// Output of `nettop -P -L 0 -J bytes_in,bytes_out -d -x`:
//
//   ,bytes_in,bytes_out,           <- header, repeated every tick
//   Safari.501,1048576,2097152,    <- name.pid,in,out (trailing comma)
//   com.apple.WebKit.Networking.733,0,1200,

use crate::error::NettoError;
use crate::process::RawSample;

/// Marks header lines
const HEADER_MARKER: &str = "bytes_in";
const FIELD_DELIMITER: char = ',';

/// Longest line kept while waiting for its newline
pub const MAX_LINE_LENGTH: usize = 4096;

/// Reassembles lines across arbitrary read boundaries
#[derive(Debug, Default)]
pub struct LineParser {
    // Bytes after the last newline seen so far
    partial: Vec<u8>,
    // Inside an overlong line that was dropped; skip to its newline
    discarding: bool,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk of feed output and return the samples in every
    /// line it completed. Malformed lines are dropped.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Vec<RawSample> {
        if self.discarding {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.discarding = false;
                    chunk = &chunk[end + 1..];
                }
                None => return Vec::new(),
            }
        }

        self.partial.extend_from_slice(chunk);

        let Some(last_newline) = self.partial.iter().rposition(|&b| b == b'\n') else {
            self.limit_partial();
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        self.limit_partial();

        String::from_utf8_lossy(&complete)
            .split('\n')
            .filter_map(|line| match parse_line(line) {
                Ok(sample) => sample,
                Err(e) => {
                    log::trace!("{}", e);
                    None
                }
            })
            .collect()
    }

    /// Bytes waiting for their newline
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    fn limit_partial(&mut self) {
        if self.partial.len() > MAX_LINE_LENGTH {
            log::trace!("Dropping {} bytes of an overlong feed line", self.partial.len());
            self.partial.clear();
            self.discarding = true;
        }
    }
}

/// Decode one line.
///
/// `Ok(None)` for header and blank lines, `Err` for anything else that does
/// not have the `name.pid,in,out` shape.
pub fn parse_line(line: &str) -> Result<Option<RawSample>, NettoError> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() || line.contains(HEADER_MARKER) {
        return Ok(None);
    }

    let malformed = || NettoError::MalformedSample(line.to_string());

    let mut fields = line.split(FIELD_DELIMITER);
    let ident = fields.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    let bytes_in = fields.next().ok_or_else(malformed)?;
    let bytes_out = fields.next().ok_or_else(malformed)?;

    let (name, pid) = ident.rsplit_once('.').ok_or_else(malformed)?;
    if name.is_empty() {
        return Err(malformed());
    }
    let pid: i32 = pid.parse().map_err(|_| malformed())?;
    let bytes_in: u64 = bytes_in.trim().parse().map_err(|_| malformed())?;
    let bytes_out: u64 = bytes_out.trim().parse().map_err(|_| malformed())?;

    Ok(Some(RawSample::new(pid, name, bytes_in, bytes_out)))
}
