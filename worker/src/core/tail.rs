//! Bounded tail buffer for captured process output.

/// Keeps only the last `limit` bytes written to it.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.limit {
            self.dropped += self.buf.len() + bytes.len() - self.limit;
            self.buf.clear();
            self.buf.extend_from_slice(&bytes[bytes.len() - self.limit..]);
            return;
        }
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.dropped += excess;
        }
    }

    /// Number of bytes discarded from the front so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Lossy UTF-8 view of the retained tail, prefixed with a marker if bytes were dropped.
    pub fn to_string_lossy(&self) -> String {
        let text = String::from_utf8_lossy(&self.buf);
        if self.dropped > 0 {
            format!("[… {} earlier bytes omitted]\n{}", self.dropped, text)
        } else {
            text.into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_limit() {
        let mut tail = TailBuffer::new(16);
        tail.push(b"hello ");
        tail.push(b"world");
        assert_eq!(tail.to_string_lossy(), "hello world");
        assert_eq!(tail.dropped(), 0);
    }

    #[test]
    fn keeps_last_bytes_over_limit() {
        let mut tail = TailBuffer::new(8);
        tail.push(b"0123456789");
        tail.push(b"ab");
        assert_eq!(tail.dropped(), 4);
        assert!(tail.to_string_lossy().ends_with("456789ab"));
        assert!(tail.to_string_lossy().starts_with("[… 4 earlier bytes omitted]"));
    }

    #[test]
    fn many_small_writes_stay_bounded() {
        let mut tail = TailBuffer::new(5);
        for _ in 0..100 {
            tail.push(b"xy");
        }
        assert_eq!(tail.dropped(), 195);
        assert!(tail.to_string_lossy().ends_with("yxyxy"));
    }
}
