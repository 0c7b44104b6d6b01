use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{Error, Result};

pub const DEFAULT_ENDPOINT: &str = "https://s3.opensky-network.org";
pub const DEFAULT_BUCKET: &str = "data-samples";
pub const DEFAULT_PREFIX: &str = "states/";

/// Idle connections kept per host on top of the worker count.
pub const POOL_HEADROOM: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    pub next_continuation: Option<String>,
}

pub trait ObjectStore: Send + Sync {
    fn provider(&self) -> &'static str;

    fn list_page<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
        continuation: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage>> + Send + 'a>>;

    /// Fetches the whole object into `dest`, replacing any existing file.
    /// Returns the number of bytes written.
    fn download_to<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct S3AnonymousStoreConfig {
    pub endpoint: String,
    pub max_connections: usize,
}

/// Unsigned S3 client for publicly listable buckets.
pub struct S3AnonymousStore {
    endpoint: String,
    client: reqwest::Client,
}

impl S3AnonymousStore {
    pub fn new(config: S3AnonymousStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_connections)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl ObjectStore for S3AnonymousStore {
    fn provider(&self) -> &'static str {
        "s3.anonymous"
    }

    fn list_page<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
        continuation: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/{}", self.endpoint, bucket);
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = continuation {
                query.push(("continuation-token", token));
            }

            let res = self
                .client
                .get(url)
                .query(&query)
                .send()
                .await
                .map_err(|e| Error::Listing {
                    message: format!("request failed: {e}"),
                })?;

            let status = res.status();
            let body = res.text().await.map_err(|e| Error::Listing {
                message: format!("read response failed: {e}"),
            })?;

            if !status.is_success() {
                return Err(Error::Listing {
                    message: format!("http {status}: {body}"),
                });
            }

            parse_list_objects_v2(&body)
        })
    }

    fn download_to<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move {
            let download_err = |message: String| Error::DownloadFailed {
                key: key.to_string(),
                message,
            };

            let url = format!("{}/{}/{}", self.endpoint, bucket, key);
            let mut res = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| download_err(format!("request failed: {e}")))?;

            let status = res.status();
            if !status.is_success() {
                return Err(download_err(format!("http {status}")));
            }

            let mut file = tokio::fs::File::create(dest).await?;
            let mut written = 0u64;
            while let Some(chunk) = res
                .chunk()
                .await
                .map_err(|e| download_err(format!("body read failed: {e}")))?
            {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(written)
        })
    }
}

pub fn parse_list_objects_v2(body: &str) -> Result<ListPage> {
    let doc = roxmltree::Document::parse(body).map_err(|e| Error::Listing {
        message: format!("invalid xml: {e}"),
    })?;
    let root = doc.root_element();

    if root.tag_name().name() == "Error" {
        let code = child_text(root, "Code").unwrap_or("unknown");
        let message = child_text(root, "Message").unwrap_or("");
        return Err(Error::Listing {
            message: format!("{code}: {message}"),
        });
    }
    if root.tag_name().name() != "ListBucketResult" {
        return Err(Error::Listing {
            message: format!("unexpected root element: {}", root.tag_name().name()),
        });
    }

    let mut objects = Vec::new();
    for contents in root
        .children()
        .filter(|n| n.tag_name().name() == "Contents")
    {
        let key = child_text(contents, "Key").ok_or_else(|| Error::Listing {
            message: "Contents without Key".to_string(),
        })?;
        let size = child_text(contents, "Size")
            .unwrap_or("0")
            .parse::<u64>()
            .map_err(|e| Error::Listing {
                message: format!("invalid Size for {key}: {e}"),
            })?;
        objects.push(ObjectSummary {
            key: key.to_string(),
            size,
        });
    }

    let truncated = child_text(root, "IsTruncated") == Some("true");
    let next_continuation = if truncated {
        child_text(root, "NextContinuationToken").map(str::to_string)
    } else {
        None
    };

    Ok(ListPage {
        objects,
        next_continuation,
    })
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.tag_name().name() == name)
        .and_then(|n| n.text())
}

#[derive(Debug, Clone)]
struct MemObject {
    bytes: Vec<u8>,
    listed_size: u64,
}

/// Single-bucket store backed by a sorted map. Pages are continued by the
/// last key returned.
#[derive(Debug)]
pub struct InMemoryStore {
    pub downloads: AtomicUsize,
    pub list_calls: AtomicUsize,
    bucket: String,
    page_size: usize,
    inner: Mutex<BTreeMap<String, MemObject>>,
}

impl InMemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self::with_page_size(bucket, 1000)
    }

    pub fn with_page_size(bucket: &str, page_size: usize) -> Self {
        Self {
            downloads: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            bucket: bucket.to_string(),
            page_size: page_size.max(1),
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn insert(&self, key: &str, bytes: Vec<u8>) {
        let listed_size = bytes.len() as u64;
        self.insert_with_listed_size(key, bytes, listed_size).await;
    }

    /// Lists the object with `listed_size` regardless of its real length.
    pub async fn insert_with_listed_size(&self, key: &str, bytes: Vec<u8>, listed_size: u64) {
        self.inner.lock().await.insert(
            key.to_string(),
            MemObject { bytes, listed_size },
        );
    }

    pub async fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.remove(key).map(|o| o.bytes)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn list_call_count(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }
}

impl ObjectStore for InMemoryStore {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn list_page<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
        continuation: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage>> + Send + 'a>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::Relaxed);
            if bucket != self.bucket {
                return Err(Error::Listing {
                    message: format!("NoSuchBucket: {bucket}"),
                });
            }

            let inner = self.inner.lock().await;
            let mut matching = inner
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .filter(|(k, _)| continuation.is_none_or(|token| k.as_str() > token));

            let objects: Vec<ObjectSummary> = matching
                .by_ref()
                .take(self.page_size)
                .map(|(k, o)| ObjectSummary {
                    key: k.clone(),
                    size: o.listed_size,
                })
                .collect();
            let more = matching.next().is_some();

            let next_continuation = if more {
                objects.last().map(|o| o.key.clone())
            } else {
                None
            };
            Ok(ListPage {
                objects,
                next_continuation,
            })
        })
    }

    fn download_to<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move {
            self.downloads.fetch_add(1, Ordering::Relaxed);
            if bucket != self.bucket {
                return Err(Error::DownloadFailed {
                    key: key.to_string(),
                    message: format!("NoSuchBucket: {bucket}"),
                });
            }

            let bytes = self
                .inner
                .lock()
                .await
                .get(key)
                .map(|o| o.bytes.clone())
                .ok_or_else(|| Error::DownloadFailed {
                    key: key.to_string(),
                    message: "NoSuchKey".to_string(),
                })?;
            tokio::fs::write(dest, &bytes).await?;
            Ok(bytes.len() as u64)
        })
    }
}
