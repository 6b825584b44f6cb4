/// A read buffer sized once for the worst-case read and reused for every
/// read. `len` is the number of valid words.
#[derive(Debug, Clone)]
pub struct BoardBuffer {
    pub board_id: usize,
    pub words: Vec<u32>,
    pub len: usize,
}

impl BoardBuffer {
    pub fn new(board_id: usize, capacity: usize) -> Self {
        Self {
            board_id,
            words: vec![0; capacity],
            len: 0,
        }
    }

    /// The words filled by the last read.
    pub fn data(&self) -> &[u32] {
        &self.words[..self.len]
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len * std::mem::size_of::<u32>()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Allocates `count` buffers for one board.
pub fn buffer_pool(board_id: usize, count: usize, capacity: usize) -> Vec<BoardBuffer> {
    (0..count)
        .map(|_| BoardBuffer::new(board_id, capacity))
        .collect()
}
