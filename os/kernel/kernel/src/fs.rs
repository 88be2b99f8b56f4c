use kernel_task::{FileRef, InodeRef};

/// Failure reported by the file system.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FsError {
    #[error("bad file")]
    BadFile,
    #[error("i/o error")]
    Io,
}

/// The file-system operations the process and memory code consume.
///
/// Files and inodes are reference counted by the file system; the kernel
/// only stores handles and balances every acquire with a release.
pub trait FileSystem {
    /// Reads at the file position and advances it. Returns the bytes read.
    ///
    /// # Errors
    /// If the file cannot be read.
    fn read(&mut self, file: FileRef, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes at the file position and advances it. Returns the bytes written.
    ///
    /// # Errors
    /// If the file cannot be written.
    fn write(&mut self, file: FileRef, data: &[u8]) -> Result<usize, FsError>;

    /// Moves the file position to `offset` bytes from the start.
    ///
    /// # Errors
    /// If the file is not seekable.
    fn lseek(&mut self, file: FileRef, offset: u32) -> Result<u32, FsError>;

    /// Adds a reference to an open file, as when a descriptor is inherited.
    fn dup(&mut self, file: FileRef);

    /// Drops a reference to an open file.
    fn close(&mut self, file: FileRef);

    /// Adds a reference to an inode.
    fn iget(&mut self, inode: InodeRef) -> InodeRef;

    /// Drops a reference to an inode.
    fn iput(&mut self, inode: InodeRef);

    /// A new reference to the root directory.
    fn root_inode(&mut self) -> InodeRef;
}
