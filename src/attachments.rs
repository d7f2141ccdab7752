//! On-disk storage for multipart uploads, one directory per ticket.

use std::io;
use std::path::PathBuf;

use uuid::Uuid;

use crate::ticket::{AttachmentRef, ticket_url};

#[derive(Clone, Debug)]
pub struct AttachmentStore {
    root: PathBuf,
    base_url: String,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    pub fn ticket_dir(&self, ticket_id: &str) -> io::Result<PathBuf> {
        ensure_component(ticket_id)?;
        Ok(self.root.join(ticket_id))
    }

    pub fn attachment_url(&self, ticket_id: &str, name: &str) -> String {
        format!("{}/attachments/{}", ticket_url(&self.base_url, ticket_id), name)
    }

    /// Write one uploaded part. The stored name is generated; the client's file name is only
    /// recorded.
    pub async fn persist(
        &self,
        ticket_id: &str,
        original_name: Option<&str>,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> io::Result<AttachmentRef> {
        let dir = self.ticket_dir(ticket_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let name = Uuid::new_v4().simple().to_string();
        tokio::fs::write(dir.join(&name), bytes).await?;
        Ok(AttachmentRef {
            size: bytes.len() as u64,
            url: self.attachment_url(ticket_id, &name),
            name,
            original_name: original_name.map(str::to_string),
            content_type: content_type.map(str::to_string),
        })
    }

    /// `Ok(None)` when the ticket or file does not exist.
    pub async fn read(&self, ticket_id: &str, name: &str) -> io::Result<Option<Vec<u8>>> {
        let dir = self.ticket_dir(ticket_id)?;
        ensure_component(name)?;
        match tokio::fs::read(dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Remove everything stored for a ticket whose message was never published.
    pub async fn discard(&self, ticket_id: &str) -> io::Result<()> {
        let dir = self.ticket_dir(ticket_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

fn ensure_component(value: &str) -> io::Result<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid path component {value:?}"),
        ))
    }
}
