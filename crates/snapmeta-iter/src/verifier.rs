//! Block-copy verification sink.

use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::{bail, Context};

use crate::iter::{IteratorMetadata, RecordSink};

/// A [`RecordSink`] that copies every enumerated extent from a source block
/// device to the same offset of a target device, then compares the two
/// devices end to end once the stream closes cleanly.
///
/// For an allocated-blocks enumeration the target starts empty; for a delta
/// enumeration it holds a restore of the base snapshot. Either way, equal
/// devices after `on_done` mean the metadata covered every differing block.
pub struct VerifierSink {
    source: File,
    target: File,
}

impl VerifierSink {
    /// `source` must be readable, `target` writable.
    pub fn new(source: File, target: File) -> Self {
        Self { source, target }
    }
}

impl RecordSink for VerifierSink {
    fn on_record(&mut self, _record_number: u64, metadata: &IteratorMetadata) -> anyhow::Result<()> {
        for block in &metadata.block_metadata {
            let mut buffer = vec![0u8; block.size_bytes as usize];
            let offset = block.byte_offset as u64;

            self.source.read_exact_at(&mut buffer, offset).with_context(|| {
                format!(
                    "failed to read source device (offset: {}, size bytes: {})",
                    block.byte_offset, block.size_bytes
                )
            })?;
            self.target.write_all_at(&buffer, offset).with_context(|| {
                format!(
                    "failed to write target device (offset: {}, size bytes: {})",
                    block.byte_offset, block.size_bytes
                )
            })?;
        }
        Ok(())
    }

    fn on_done(&mut self, _record_count: u64) -> anyhow::Result<()> {
        const CHUNK: usize = 256;
        let mut offset = 0u64;
        loop {
            let mut source_buffer = [0u8; CHUNK];
            let mut target_buffer = [0u8; CHUNK];

            let source_read = read_chunk(&self.source, &mut source_buffer, offset)
                .context("error reading source device contents")?;
            let target_read = read_chunk(&self.target, &mut target_buffer, offset)
                .context("error reading target device contents")?;

            if source_read != target_read
                || source_buffer[..source_read] != target_buffer[..target_read]
            {
                bail!("source and target device contents do not match");
            }
            if source_read == 0 {
                return Ok(());
            }
            offset += source_read as u64;
        }
    }
}

/// Read at `offset` until the buffer is full or the device ends.
fn read_chunk(file: &File, buffer: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read_at(&mut buffer[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
