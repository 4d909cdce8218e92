use std::fmt;
use std::io::{self, Cursor, Write};

/// Writes into a fixed output buffer, all-or-nothing per `try_write`.
pub(crate) struct Writer<'a> {
    cursor: Cursor<&'a mut [u8]>,
}

impl<'a> Writer<'a> {
    pub fn new(output: &'a mut [u8]) -> Writer<'a> {
        Self {
            cursor: Cursor::new(output),
        }
    }

    pub fn len(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn available(&self) -> usize {
        self.cursor.get_ref().len() - self.len()
    }

    /// Run `apply` against the buffer. If it fails, nothing is written.
    pub fn try_write(&mut self, apply: impl FnOnce(&mut Self) -> io::Result<()>) -> bool {
        let pos = self.cursor.position();
        let success = apply(self).is_ok();
        if !success {
            self.cursor.set_position(pos);
        }
        success
    }
}

impl<'a> Write for Writer<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.available() {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Renders wire bytes for trace logging.
pub(crate) struct LogData<'a>(pub &'a [u8]);

impl<'a> fmt::Display for LogData<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.escape_ascii() {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

pub(crate) fn log_data(data: &[u8]) {
    if !log_enabled!(log::Level::Trace) {
        return;
    }
    const MAX: usize = 1024;
    let (show, rest) = if data.len() > MAX {
        (&data[..MAX], data.len() - MAX)
    } else {
        (data, 0)
    };
    if rest > 0 {
        trace!("{} (+{} bytes)", LogData(show), rest);
    } else {
        trace!("{}", LogData(show));
    }
}

/// Compare ascii strings ignoring case.
pub(crate) fn compare_lowercase_ascii(a: &str, lowercased: &str) -> bool {
    if a.len() != lowercased.len() {
        return false;
    }

    for (a, b) in a.chars().zip(lowercased.chars()) {
        if !a.is_ascii() {
            return false;
        }
        let norm = a.to_ascii_lowercase();
        if norm != b {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_rolls_back_on_overflow() {
        let mut buf = [0_u8; 8];
        let mut w = Writer::new(&mut buf);
        assert!(w.try_write(|w| write!(w, "abc")));
        assert!(!w.try_write(|w| write!(w, "defghijk")));
        assert_eq!(w.len(), 3);
        assert_eq!(w.available(), 5);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn lowercase_compare() {
        assert!(compare_lowercase_ascii("Keep-Alive", "keep-alive"));
        assert!(!compare_lowercase_ascii("close", "keep-alive"));
        assert!(!compare_lowercase_ascii("clos", "close"));
    }

    #[test]
    fn log_data_escapes() {
        assert_eq!(LogData(b"a\r\n").to_string(), "a\\r\\n");
    }
}
