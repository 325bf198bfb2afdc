//! Swap partition abstraction: a fixed number of fixed-size clusters a
//! process's evicted pages are written to and read back from.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use crate::addr::{ClusterNo, PAGE_SIZE};
use crate::config::PartitionConfig;

/// Backing store for swapped-out pages. One cluster == one page.
///
/// Implementations only need to guarantee that a cluster previously written
/// reads back byte-identical; this crate never interprets cluster contents.
pub trait Partition: Send + Sync {
    fn num_clusters(&self) -> u64;

    /// Reads cluster `n` into `buf`. Returns `Ok(())` on success.
    fn read_cluster(&self, n: ClusterNo, buf: &mut [u8; PAGE_SIZE as usize]) -> io::Result<()>;

    /// Writes `buf` into cluster `n`.
    fn write_cluster(&self, n: ClusterNo, buf: &[u8; PAGE_SIZE as usize]) -> io::Result<()>;
}

/// A partition file opened from a [`PartitionConfig`]. Clusters are stored
/// back-to-back starting at byte offset 0.
pub struct FileBackedPartition {
    file: Mutex<File>,
    num_clusters: u64,
}

impl FileBackedPartition {
    pub fn open(config: &PartitionConfig) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.file_path)?;
        file.set_len(u64::from(PAGE_SIZE) * config.num_clusters)?;
        Ok(Self {
            file: Mutex::new(file),
            num_clusters: config.num_clusters,
        })
    }
}

impl Partition for FileBackedPartition {
    fn num_clusters(&self) -> u64 {
        self.num_clusters
    }

    fn read_cluster(&self, n: ClusterNo, buf: &mut [u8; PAGE_SIZE as usize]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(u64::from(n) * u64::from(PAGE_SIZE)))?;
        file.read_exact(buf)
    }

    fn write_cluster(&self, n: ClusterNo, buf: &[u8; PAGE_SIZE as usize]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(u64::from(n) * u64::from(PAGE_SIZE)))?;
        file.write_all(buf)
    }
}

/// An in-memory partition, for tests and for hosts that don't want a real
/// swap file on disk.
pub struct MemoryPartition {
    clusters: Mutex<Vec<[u8; PAGE_SIZE as usize]>>,
}

impl MemoryPartition {
    #[must_use]
    pub fn new(num_clusters: u64) -> Self {
        Self {
            clusters: Mutex::new(vec![[0u8; PAGE_SIZE as usize]; num_clusters as usize]),
        }
    }
}

impl Partition for MemoryPartition {
    fn num_clusters(&self) -> u64 {
        self.clusters.lock().unwrap().len() as u64
    }

    fn read_cluster(&self, n: ClusterNo, buf: &mut [u8; PAGE_SIZE as usize]) -> io::Result<()> {
        let clusters = self.clusters.lock().unwrap();
        buf.copy_from_slice(&clusters[n as usize]);
        Ok(())
    }

    fn write_cluster(&self, n: ClusterNo, buf: &[u8; PAGE_SIZE as usize]) -> io::Result<()> {
        let mut clusters = self.clusters.lock().unwrap();
        clusters[n as usize].copy_from_slice(buf);
        Ok(())
    }
}
