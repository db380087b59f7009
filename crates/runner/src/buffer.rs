use std::sync::Mutex;

/// StreamBuffer accumulates the bytes read from one child stream.
///
/// Appends come from a single drainer task. The snapshot is taken once,
/// after that task has been joined, so the join (not the mutex) is what
/// guarantees that every chunk read before exit is present.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        self.bytes.lock().unwrap().extend_from_slice(chunk);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::StreamBuffer;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_append_and_snapshot() {
        let buf = StreamBuffer::new();
        assert!(buf.is_empty());

        buf.append(b"hello ");
        buf.append(b"");
        buf.append(b"world");

        assert_eq!(buf.snapshot(), b"hello world");
        assert_eq!(buf.len(), 11);
        // Snapshots don't consume.
        assert_eq!(buf.snapshot(), b"hello world");
    }

    // Two writers racing on two buffers never lose, duplicate, or reorder
    // chunks within a buffer.
    #[quickcheck]
    fn test_qc_concurrent_appends(out: Vec<Vec<u8>>, err: Vec<Vec<u8>>) -> bool {
        let (out_buf, err_buf) = (StreamBuffer::new(), StreamBuffer::new());

        std::thread::scope(|scope| {
            scope.spawn(|| out.iter().for_each(|chunk| out_buf.append(chunk)));
            scope.spawn(|| err.iter().for_each(|chunk| err_buf.append(chunk)));
        });

        out_buf.snapshot() == out.concat() && err_buf.snapshot() == err.concat()
    }
}
