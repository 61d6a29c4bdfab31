use super::{
    BoxReader, BoxWriter, ControlHandle, Meta, Storage, TransferController, TransferOptions,
    IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::error::{Error, Result};
use crate::filelist::NodeType;
use crate::paths;
use async_trait::async_trait;
use opendal::{layers::TimeoutLayer, Metadata, Metakey, Operator};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// 基于 opendal 的远程存储（S3 / WebDAV）
pub struct RemoteStorage {
    operator: Operator,
    name: String,
}

impl RemoteStorage {
    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let name = format!(
            "s3://{}{}",
            bucket,
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self::from_operator(Operator::new(builder)?.finish(), name))
    }

    pub fn webdav(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self::from_operator(Operator::new(builder)?.finish(), name))
    }

    /// 包装任意 opendal Operator，并添加超时层
    pub fn from_operator(operator: Operator, name: impl Into<String>) -> Self {
        let operator = operator.layer(
            TimeoutLayer::default()
                .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
        );

        Self {
            operator,
            name: name.into(),
        }
    }

    fn meta_from(name: String, meta: &Metadata) -> Meta {
        Meta {
            node_type: if meta.is_dir() {
                NodeType::Dir
            } else {
                NodeType::File
            },
            name,
            modified: meta.last_modified().map_or(0, |t| t.timestamp()),
            size: if meta.is_dir() { 0 } else { meta.content_length() },
        }
    }

    /// opendal 使用相对路径，目录以 `/` 结尾
    fn object_path(path: &str) -> String {
        paths::normalize(path).trim_start_matches('/').to_string()
    }

    fn dir_path(path: &str) -> String {
        let path = Self::object_path(path);
        if path.is_empty() {
            "/".to_string()
        } else {
            paths::dir_normalize(&path)
        }
    }
}

async fn upload_chunks(
    operator: Operator,
    path: String,
    mut source: BoxReader,
    handle: ControlHandle,
) -> Result<()> {
    let mut writer = operator.writer(&path).await?;
    let mut limiter = handle.limiter();
    let mut buf = vec![0u8; handle.chunk_size()];

    let copied: Result<()> = async {
        loop {
            handle.ensure_running()?;
            let n = source.read(&mut buf).await?;
            handle.ensure_running()?;

            if n == 0 {
                return Ok(());
            }

            writer.write(buf[..n].to_vec()).await?;
            handle.add_transferred(n as u64);
            limiter.consume(n as u64, handle.token()).await?;
        }
    }
    .await;

    match copied {
        Ok(()) => {
            writer.close().await?;
            Ok(())
        }
        Err(e) => {
            // 放弃未完成的上传，不提交部分内容
            if let Err(abort_err) = writer.abort().await {
                tracing::warn!("放弃上传失败 {}: {}", path, abort_err);
            }
            Err(e)
        }
    }
}

async fn download_chunks(
    operator: Operator,
    path: String,
    mut dest: BoxWriter,
    handle: ControlHandle,
) -> Result<()> {
    let size = operator.stat(&path).await?.content_length();
    let reader = operator.reader(&path).await?;
    let mut limiter = handle.limiter();
    let chunk = handle.chunk_size() as u64;
    let mut offset = 0u64;

    while offset < size {
        handle.ensure_running()?;
        let end = (offset + chunk).min(size);
        let buffer = reader.read(offset..end).await?;
        handle.ensure_running()?;

        let bytes = buffer.to_bytes();
        if bytes.is_empty() {
            return Err(Error::Transient(format!("读取中断: {}", path)));
        }

        dest.write_all(&bytes).await?;
        handle.add_transferred(bytes.len() as u64);
        offset += bytes.len() as u64;
        limiter.consume(bytes.len() as u64, handle.token()).await?;
    }

    dest.flush().await?;
    dest.shutdown().await?;
    Ok(())
}

#[async_trait]
impl Storage for RemoteStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelizable(&self) -> bool {
        true
    }

    async fn get_meta(&self, path: &str) -> Result<Meta> {
        let (_, name) = paths::split(path);
        let object = Self::object_path(path);

        if !object.is_empty() {
            match self.operator.stat(&object).await {
                Ok(meta) => return Ok(Self::meta_from(name, &meta)),
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // 对象存储中的目录只能通过带 `/` 的路径找到
        match self.operator.stat(&Self::dir_path(path)).await {
            Ok(meta) => Ok(Self::meta_from(name, &meta)),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn listdir(&self, path: &str) -> Result<Vec<Meta>> {
        let dir = Self::dir_path(path);
        let entries = self
            .operator
            .list_with(&dir)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await?;

        // 部分服务会在结果中包含目录本身
        Ok(entries
            .into_iter()
            .filter(|entry| entry.path().trim_matches('/') != dir.trim_matches('/'))
            .map(|entry| {
                let name = entry.name().trim_end_matches('/').to_string();
                Self::meta_from(name, entry.metadata())
            })
            .collect())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        if self.exists(path).await? {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        self.operator.create_dir(&Self::dir_path(path)).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let meta = self.get_meta(path).await?;
        if meta.is_dir() {
            self.operator.remove_all(&Self::dir_path(path)).await?;
        } else {
            self.operator.delete(&Self::object_path(path)).await?;
        }
        Ok(())
    }

    fn upload(
        &self,
        source: BoxReader,
        path: &str,
        opts: TransferOptions,
    ) -> TransferController {
        let operator = self.operator.clone();
        let path = Self::object_path(path);

        TransferController::new(&opts, move |handle| {
            upload_chunks(operator, path, source, handle)
        })
    }

    fn download(
        &self,
        path: &str,
        dest: BoxWriter,
        opts: TransferOptions,
    ) -> TransferController {
        let operator = self.operator.clone();
        let path = Self::object_path(path);

        TransferController::new(&opts, move |handle| {
            download_chunks(operator, path, dest, handle)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_storage(dir: &tempfile::TempDir) -> RemoteStorage {
        let builder = opendal::services::Fs::default().root(dir.path().to_str().unwrap());
        RemoteStorage::from_operator(Operator::new(builder).unwrap().finish(), "fs")
    }

    #[tokio::test]
    async fn test_remote_roundtrip_on_fs_service() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fs_storage(&dir);
        assert!(storage.parallelizable());

        storage.mkdir("/d").await.unwrap();
        assert!(matches!(
            storage.mkdir("/d").await.unwrap_err(),
            Error::AlreadyExists(_)
        ));

        let source: BoxReader = Box::pin(&b"remote data"[..]);
        let opts = TransferOptions {
            chunk_size: 4,
            ..Default::default()
        };
        storage.upload(source, "/d/f.bin", opts.clone()).work().await.unwrap();

        let meta = storage.get_meta("/d/f.bin").await.unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(storage.get_meta("/d").await.unwrap().node_type, NodeType::Dir);

        let names: Vec<String> = storage
            .listdir("/d")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["f.bin"]);

        let (writer, mut reader) = tokio::io::duplex(64);
        let mut download = storage.download("/d/f.bin", Box::pin(writer), opts);
        let (done, out) = tokio::join!(download.work(), async {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.map(|_| out)
        });
        done.unwrap();
        assert_eq!(out.unwrap(), b"remote data");

        storage.remove("/d").await.unwrap();
        assert!(!storage.exists("/d/f.bin").await.unwrap());
    }
}
