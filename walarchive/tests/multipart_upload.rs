use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{Duration, sleep};
use walarchive::StoreError;
use walarchive::cadapter::{
    ClientConfig, ObjectBackend, ObjectClient, ObjectReader, PartMetadata, ProviderLimits,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Create,
    Dispatched(u32),
    Uploaded(u32),
    Complete(Vec<u32>),
    Abort,
}

/// Backend that records every call and fails on request.
struct ScriptedBackend {
    limits: ProviderLimits,
    calls: Mutex<Vec<Call>>,
    failing_parts: HashSet<u32>,
    panicking_parts: HashSet<u32>,
    fail_complete: bool,
    /// Milliseconds part `n` takes to upload.
    part_delay: fn(u32) -> u64,
    bodies: Mutex<Vec<(u32, Bytes)>>,
}

impl ScriptedBackend {
    fn new(part_delay: fn(u32) -> u64) -> Self {
        Self {
            limits: ProviderLimits {
                max_parts: 10_000,
                min_part_size: 1024,
                max_object_size: 1 << 20,
            },
            calls: Mutex::new(Vec::new()),
            failing_parts: HashSet::new(),
            panicking_parts: HashSet::new(),
            fail_complete: false,
            part_delay,
            bodies: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, parts: &[u32]) -> Self {
        self.failing_parts = parts.iter().copied().collect();
        self
    }

    fn panicking(mut self, parts: &[u32]) -> Self {
        self.panicking_parts = parts.iter().copied().collect();
        self
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().into_iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl ObjectBackend for ScriptedBackend {
    type Upload = String;

    fn limits(&self) -> ProviderLimits {
        self.limits
    }

    async fn check_connectivity(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_objects(&self, _prefix: &str, _delimiter: &str) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    async fn get_object(&self, _key: &str) -> Result<Option<ObjectReader>, StoreError> {
        Ok(None)
    }

    async fn put_object(&self, _key: &str, _body: Bytes) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_multipart_upload(&self, _key: &str) -> Result<String, StoreError> {
        self.record(Call::Create);
        Ok("upload-1".to_string())
    }

    async fn upload_part(
        &self,
        upload: &String,
        _key: &str,
        body: Bytes,
        part_number: u32,
    ) -> Result<PartMetadata, StoreError> {
        assert_eq!(upload, "upload-1");
        self.record(Call::Dispatched(part_number));
        sleep(Duration::from_millis((self.part_delay)(part_number))).await;
        if self.panicking_parts.contains(&part_number) {
            panic!("worker for part {part_number} crashed");
        }
        if self.failing_parts.contains(&part_number) {
            return Err(StoreError::provider("upload_part", format!("part {part_number} rejected")));
        }
        self.bodies.lock().unwrap().push((part_number, body));
        self.record(Call::Uploaded(part_number));
        Ok(PartMetadata::new(part_number, Some(format!("etag-{part_number}"))))
    }

    async fn complete_multipart_upload(
        &self,
        _upload: &String,
        _key: &str,
        parts: &[PartMetadata],
    ) -> Result<(), StoreError> {
        self.record(Call::Complete(parts.iter().map(|p| p.part_number).collect()));
        if self.fail_complete {
            return Err(StoreError::provider("complete_multipart_upload", "InvalidPart"));
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, _upload: &String, _key: &str) -> Result<(), StoreError> {
        self.record(Call::Abort);
        Ok(())
    }

    async fn delete_objects(&self, _keys: &[String]) -> Result<(), StoreError> {
        Ok(())
    }
}

fn client(backend: ScriptedBackend, jobs: usize) -> ObjectClient<ScriptedBackend> {
    ObjectClient::with_config(
        backend,
        ClientConfig {
            jobs,
            multipart_threshold: 1024,
        },
    )
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_parts_finishing_in_reverse_are_completed_in_order() {
    // part 1 is the slowest, part 5 the fastest
    let client = client(ScriptedBackend::new(|n| (6 - n as u64) * 40), 5);
    let data = payload(5 * 1024);
    client
        .upload_large_object(data.as_slice(), "wal/seg", data.len() as u64)
        .await
        .unwrap();

    let calls = client.backend().calls();
    assert_eq!(calls.first(), Some(&Call::Create));
    let finished: Vec<u32> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Uploaded(n) => Some(*n),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![5, 4, 3, 2, 1]);
    assert_eq!(calls.last(), Some(&Call::Complete(vec![1, 2, 3, 4, 5])));
    assert_eq!(client.backend().count(|c| *c == Call::Abort), 0);

    let mut bodies = client.backend().bodies.lock().unwrap().clone();
    bodies.sort_by_key(|(n, _)| *n);
    let joined: Vec<u8> = bodies.iter().flat_map(|(_, b)| b.iter().copied()).collect();
    assert_eq!(joined, data);
}

#[tokio::test]
async fn test_failed_part_stops_dispatch_and_aborts_once() {
    let client = client(ScriptedBackend::new(|_| 5).failing(&[3]), 1);
    let data = payload(5 * 1024);
    let err = client
        .upload_large_object(data.as_slice(), "wal/seg", data.len() as u64)
        .await
        .unwrap_err();

    match err {
        StoreError::UploadFailed { key, source } => {
            assert_eq!(key, "wal/seg");
            assert!(matches!(*source, StoreError::Provider { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    let calls = client.backend().calls();
    assert_eq!(
        calls,
        vec![
            Call::Create,
            Call::Dispatched(1),
            Call::Uploaded(1),
            Call::Dispatched(2),
            Call::Uploaded(2),
            Call::Dispatched(3),
            Call::Abort,
        ]
    );
}

#[tokio::test]
async fn test_panicking_worker_stops_dispatch() {
    let client = client(ScriptedBackend::new(|_| 1).panicking(&[1]), 1);
    let data = payload(5 * 1024);
    let err = client
        .upload_large_object(data.as_slice(), "wal/seg", data.len() as u64)
        .await
        .unwrap_err();

    match err {
        StoreError::UploadFailed { source, .. } => {
            assert!(matches!(*source, StoreError::Provider { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        client.backend().calls(),
        vec![Call::Create, Call::Dispatched(1), Call::Abort]
    );
}

#[tokio::test]
async fn test_concurrent_failures_abort_once() {
    let backend = ScriptedBackend::new(|n| if n >= 3 { 1 } else { 30 }).failing(&[3, 4]);
    let client = client(backend, 2);
    let data = payload(8 * 1024);
    let err = client
        .upload_large_object(data.as_slice(), "wal/seg", data.len() as u64)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UploadFailed { .. }));

    let backend = client.backend();
    assert_eq!(backend.count(|c| *c == Call::Abort), 1);
    assert_eq!(backend.count(|c| matches!(c, Call::Complete(_))), 0);
    assert_eq!(backend.count(|c| matches!(c, Call::Dispatched(n) if *n >= 5)), 0);
    assert_eq!(backend.calls().last(), Some(&Call::Abort));
}

#[tokio::test]
async fn test_rejected_completion_aborts() {
    let mut backend = ScriptedBackend::new(|_| 1);
    backend.fail_complete = true;
    let client = client(backend, 2);
    let data = payload(3 * 1024);
    let err = client
        .upload_large_object(data.as_slice(), "wal/seg", data.len() as u64)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UploadFailed { .. }));
    let calls = client.backend().calls();
    assert_eq!(&calls[calls.len() - 2..], &[Call::Complete(vec![1, 2, 3]), Call::Abort]);
}

#[tokio::test]
async fn test_oversized_object_makes_no_provider_calls() {
    let client = client(ScriptedBackend::new(|_| 0), 2);
    let err = client
        .upload_large_object(&b""[..], "wal/huge", (1 << 20) + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ObjectTooLarge { .. }));
    assert!(client.backend().calls().is_empty());
}
