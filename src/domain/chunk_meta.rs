/// Position of one chunk within a chunked upload, as declared by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    pub index: u32,
    pub total: u32,
}

impl ChunkMeta {
    /// Parse the raw `chunk_index` and `total_chunks` form fields. The error
    /// names the offending field.
    pub fn parse(
        index: &str,
        total: &str,
    ) -> Result<Self, String> {
        let index: u32 = index
            .trim()
            .parse()
            .map_err(|_| format!("chunk_index: not a non-negative integer: {index:?}"))?;
        let total: u32 = total
            .trim()
            .parse()
            .map_err(|_| format!("total_chunks: not a non-negative integer: {total:?}"))?;
        if total == 0 {
            return Err("total_chunks: must be at least 1".to_string());
        }
        if index >= total {
            return Err(format!(
                "chunk_index: {index} is out of range for {total} chunks"
            ));
        }
        Ok(Self { index, total })
    }

    pub fn is_first(&self) -> bool { self.index == 0 }

    pub fn is_last(&self) -> bool { self.index + 1 == self.total }
}
