use std::{
    io::{Read, Seek, Write},
    path::PathBuf,
};

use bytes::{Bytes, BytesMut};

/// Byte level access to the files a node shares.
pub trait FileStore: Send + Sync {
    /// Reads up to `len` bytes at `offset`. Fewer bytes are returned near the end of the file,
    /// none past it.
    fn read_block(&self, file: &str, offset: u64, len: usize) -> std::io::Result<Bytes>;

    /// Writes `data` at `offset`, creating the file if needed. Existing bytes outside the block
    /// are left untouched.
    fn write_block(&self, file: &str, offset: u64, data: &[u8]) -> std::io::Result<()>;

    fn remove(&self, file: &str) -> std::io::Result<()>;

    /// Name and byte length of every stored file.
    fn list(&self) -> std::io::Result<Vec<(String, u64)>>;
}

/// Files kept flat inside one directory. Names starting with a dot are reserved and not listed.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, file: &str) -> std::io::Result<PathBuf> {
        let valid = !file.is_empty()
            && !file.starts_with('.')
            && !file.contains(['/', '\\'])
            && file != "..";
        if !valid {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid file name: {file:?}"),
            ));
        }
        Ok(self.root.join(file))
    }
}

impl FileStore for DirStore {
    fn read_block(&self, file: &str, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let mut handle = std::fs::File::open(self.path(file)?)?;
        handle.seek(std::io::SeekFrom::Start(offset))?;
        let mut data = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            match handle.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        data.truncate(filled);
        Ok(data.freeze())
    }

    fn write_block(&self, file: &str, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut handle = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(file)?)?;
        handle.seek(std::io::SeekFrom::Start(offset))?;
        handle.write_all(data)?;
        Ok(())
    }

    fn remove(&self, file: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.path(file)?) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }

    fn list(&self) -> std::io::Result<Vec<(String, u64)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) if !name.starts_with('.') => name,
                _ => continue,
            };
            files.push((name, metadata.len()));
        }
        files.sort();
        Ok(files)
    }
}
