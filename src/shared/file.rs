use std::path::Path;

use anyhow::{Context, Result};
use tokio::{fs, io::AsyncReadExt};

use crate::entities::OmittableString;

/// Removes everything inside `path`, keeping the directory itself. Used to
/// recycle task slots between runs.
pub async fn empty_directory(path: &Path) -> Result<()> {
    let mut entries = fs::read_dir(path).await.context("Error listing the directory")?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            fs::remove_dir_all(entry.path()).await?;
        } else {
            fs::remove_file(entry.path()).await?;
        }
    }

    Ok(())
}

/// Total byte size of all regular files under `path`, recursively.
pub async fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    let mut queue = vec![path.to_path_buf()];

    while let Some(directory) = queue.pop() {
        let mut entries = fs::read_dir(&directory).await.context("Error listing the directory")?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                queue.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

/// Reads the first `limit` bytes of a file into an [`OmittableString`],
/// recording how many bytes were left behind. Missing files yield an empty
/// string.
pub async fn read_preview(path: &Path, limit: usize) -> Result<OmittableString> {
    let file = match fs::File::open(path).await {
        Err(_) => return Ok(OmittableString::default()),
        Ok(file) => file,
    };

    let size = file.metadata().await?.len() as usize;
    let mut data = vec![0u8; size.min(limit)];
    let mut reader = file;
    reader.read_exact(&mut data).await.context("Error reading the file")?;

    Ok(OmittableString {
        data: String::from_utf8_lossy(&data).into_owned(),
        omitted_bytes: size.saturating_sub(data.len()),
    })
}

pub async fn copy_directory(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).await?;

    let mut queue = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((from, to)) = queue.pop() {
        let mut entries = fs::read_dir(&from).await.context("Error listing the directory")?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target_path = to.join(entry.file_name());
            if file_type.is_dir() {
                fs::create_dir_all(&target_path).await?;
                queue.push((entry.path(), target_path));
            } else {
                fs::copy(entry.path(), target_path).await.context("Error copying the file")?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::fs;

    #[tokio::test]
    async fn test_empty_directory() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "hello").await.unwrap();
        fs::create_dir_all(root.path().join("nested/deeper")).await.unwrap();

        super::empty_directory(root.path()).await.unwrap();

        let mut entries = fs::read_dir(root.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_size() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "12345").await.unwrap();
        fs::create_dir_all(root.path().join("nested")).await.unwrap();
        fs::write(root.path().join("nested/b.txt"), "123").await.unwrap();

        assert_eq!(super::directory_size(root.path()).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_read_preview() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("data.txt");
        fs::write(&path, "hello world").await.unwrap();

        let preview = super::read_preview(&path, 5).await.unwrap();
        assert_eq!(preview.data, "hello");
        assert_eq!(preview.omitted_bytes, 6);

        let missing = super::read_preview(&root.path().join("missing"), 5).await.unwrap();
        assert_eq!(missing.data, "");
    }
}
