use parking_lot::Mutex;

/// Capped free-list of fixed-size byte buffers for the relay loops.
pub struct BufPool {
    buf_size: usize,
    max_free: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufPool {
    pub fn new(buf_size: usize, max_free: usize) -> Self {
        Self {
            buf_size,
            max_free,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        vec![0u8; self.buf_size]
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.buf_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buf);
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }
}
