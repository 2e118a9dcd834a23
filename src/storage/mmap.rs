//! Memory-mapped block file.
//!
//! The file is a flat array of [`BLOCK_SIZE`] blocks. `grow` remaps, so the
//! borrow checker forbids holding block slices across it; the cache copies
//! block bytes into its own buffers and only touches the map on miss, flush,
//! and grow.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::BLOCK_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: MmapMut,
    block_count: u32,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open slice file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?;

        let file_size = metadata.len();

        ensure!(
            file_size > 0,
            "cannot open empty slice file '{}'",
            path.display()
        );

        ensure!(
            file_size % BLOCK_SIZE as u64 == 0,
            "slice file '{}' size {} is not a multiple of block size {}",
            path.display(),
            file_size,
            BLOCK_SIZE
        );

        let block_count = (file_size / BLOCK_SIZE as u64) as u32;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can be
        // modified externally, leading to undefined behavior. This is safe because:
        // 1. The file is opened with exclusive write access (read+write mode)
        // 2. Slice files are not meant to be modified by external processes
        // 3. The mmap lifetime is tied to MmapStorage, preventing use-after-unmap
        // 4. All access goes through block()/block_mut() which bounds-check the id
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            block_count,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_block_count: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_block_count > 0,
            "initial block count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create slice file '{}'", path.display()))?;

        let file_size = initial_block_count as u64 * BLOCK_SIZE as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can be
        // modified externally. This is safe because:
        // 1. We just created this file with exclusive access (truncate=true)
        // 2. The file size is set to a valid multiple of BLOCK_SIZE
        // 3. The mmap lifetime is tied to MmapStorage, preventing use-after-unmap
        // 4. All access goes through block()/block_mut() which bounds-check the id
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            block_count: initial_block_count,
        })
    }

    pub fn block(&self, block_no: u32) -> Result<&[u8]> {
        ensure!(
            block_no < self.block_count,
            "block {} out of bounds (block_count={})",
            block_no,
            self.block_count
        );

        let offset = block_no as usize * BLOCK_SIZE;
        Ok(&self.mmap[offset..offset + BLOCK_SIZE])
    }

    pub fn block_mut(&mut self, block_no: u32) -> Result<&mut [u8]> {
        ensure!(
            block_no < self.block_count,
            "block {} out of bounds (block_count={})",
            block_no,
            self.block_count
        );

        let offset = block_no as usize * BLOCK_SIZE;
        Ok(&mut self.mmap[offset..offset + BLOCK_SIZE])
    }

    pub fn grow(&mut self, new_block_count: u32) -> Result<()> {
        if new_block_count <= self.block_count {
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = new_block_count as u64 * BLOCK_SIZE as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because the old mmap becomes invalid.
        // This is safe because:
        // 1. grow() requires &mut self, so no block references can exist (borrow checker)
        // 2. We flushed the old mmap above, ensuring data is written to disk
        // 3. The file was extended to new_size before remapping
        // 4. The old mmap is dropped when we assign the new one
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.block_count = new_block_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn file_size(&self) -> u64 {
        self.block_count as u64 * BLOCK_SIZE as u64
    }
}
