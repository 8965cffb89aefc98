use crate::config::READ_BUF_SIZE;

pub type ReadBuf = Box<[u8; READ_BUF_SIZE]>;

/// Free list of read buffers. How many connections may be open is the
/// slab's business; this only bounds how many idle buffers are kept around.
pub struct BufPool {
    spare: Vec<ReadBuf>,
    keep: usize,
}

impl BufPool {
    pub fn new(keep: usize) -> Self {
        Self { spare: Vec::new(), keep }
    }

    #[inline]
    pub fn spare(&self) -> usize {
        self.spare.len()
    }

    /// A zeroed buffer, reused when one is spare.
    #[inline]
    pub fn take(&mut self) -> ReadBuf {
        self.spare.pop().unwrap_or_else(|| Box::new([0u8; READ_BUF_SIZE]))
    }

    /// Zero `buf` and keep it for reuse, or drop it if enough are spare.
    #[inline]
    pub fn give_back(&mut self, mut buf: ReadBuf) {
        if self.spare.len() < self.keep {
            buf.fill(0);
            self.spare.push(buf);
        }
    }
}
