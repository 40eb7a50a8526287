//! Line iterator that walks a seekable source from end to start.

use std::io::{self, Read, Seek, SeekFrom};

const CHUNK: u64 = 8 * 1024;

/// Yields the lines of `R` last-first, without their `\n` terminators.
///
/// The source is read backwards in fixed-size chunks, so memory stays bounded
/// by the longest line plus one chunk. Invalid UTF-8 is replaced lossily.
pub struct ReverseLines<R> {
    reader: R,
    /// Offset of the first byte already pulled into `buf`.
    pos: u64,
    buf: Vec<u8>,
    started: bool,
    done: bool,
}

impl<R: Read + Seek> ReverseLines<R> {
    pub fn new(mut reader: R) -> io::Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader,
            pos: len,
            buf: Vec::new(),
            started: false,
            done: len == 0,
        })
    }

    fn fill(&mut self) -> io::Result<()> {
        let n = CHUNK.min(self.pos);
        self.pos -= n;
        self.reader.seek(SeekFrom::Start(self.pos))?;

        let mut chunk = vec![0u8; n as usize];
        self.reader.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&self.buf);
        self.buf = chunk;

        if !self.started {
            self.started = true;
            // terminator of the last line
            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
            }
        }
        Ok(())
    }
}

impl<R: Read + Seek> Iterator for ReverseLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if self.started {
                if let Some(i) = self.buf.iter().rposition(|&b| b == b'\n') {
                    let line = self.buf.split_off(i + 1);
                    self.buf.truncate(i);
                    return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
                }
                if self.pos == 0 {
                    self.done = true;
                    let line = std::mem::take(&mut self.buf);
                    return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
                }
            }

            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(data: &[u8]) -> Vec<String> {
        ReverseLines::new(Cursor::new(data.to_vec()))
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
    }

    #[test]
    fn empty_source() {
        assert!(collect(b"").is_empty());
    }

    #[test]
    fn lines_come_out_reversed() {
        assert_eq!(collect(b"a\nb\nc\n"), vec!["c", "b", "a"]);
        assert_eq!(collect(b"a\nb\nc"), vec!["c", "b", "a"]);
    }

    #[test]
    fn blank_lines_are_kept() {
        assert_eq!(collect(b"a\n\nb\n"), vec!["b", "", "a"]);
    }

    #[test]
    fn lines_spanning_chunks() {
        let long = "x".repeat(CHUNK as usize * 2 + 17);
        let data = format!("first\n{long}\nlast\n");
        let lines = collect(data.as_bytes());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "last");
        assert_eq!(lines[1], long);
        assert_eq!(lines[2], "first");
    }

    #[test]
    fn matches_forward_order_reversed() {
        let data: String = (0..5000).map(|i| format!("line {i}\n")).collect();
        let mut forward: Vec<String> = data.lines().map(String::from).collect();
        forward.reverse();
        assert_eq!(collect(data.as_bytes()), forward);
    }
}
