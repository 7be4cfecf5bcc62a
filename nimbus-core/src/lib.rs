mod client;

pub use client::{MIME_DIR, RemoteClient, RemoteError, RemoteFile};
