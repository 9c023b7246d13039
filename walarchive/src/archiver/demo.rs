//! End-to-end example: archive a generated segment into a local directory
//! backend through the multipart path, restore it and check it byte for byte.

use std::error::Error;
use std::path::Path;

use super::WalArchiver;
use crate::cadapter::client::{ClientConfig, ObjectClient};
use crate::cadapter::localfs::LocalFsBackend;
use crate::cadapter::plan::ProviderLimits;
use crate::meta::WalCatalog;

const SEGMENT_NAME: &str = "000000010000000000000001";
const SEGMENT_SIZE: usize = 3 * 1024 * 1024 + 17;

/// Run the demo under `root`. Returns the catalog lines for printing.
pub async fn e2e_localfs_demo<P: AsRef<Path>>(root: P) -> Result<Vec<String>, Box<dyn Error>> {
    let root = root.as_ref();
    let wal_dir = root.join("pg_wal");
    tokio::fs::create_dir_all(&wal_dir).await?;
    let segment = wal_dir.join(SEGMENT_NAME);
    let data: Vec<u8> = (0..SEGMENT_SIZE).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(&segment, &data).await?;

    // small parts so the segment goes through the multipart path
    let limits = ProviderLimits {
        min_part_size: 512 * 1024,
        ..ProviderLimits::gcs()
    };
    let bucket = root.join("bucket");
    tokio::fs::create_dir_all(&bucket).await?;
    let client = ObjectClient::with_config(
        LocalFsBackend::with_limits(&bucket, limits),
        ClientConfig {
            jobs: 2,
            multipart_threshold: 1024 * 1024,
        },
    );
    if !client.test_connectivity().await {
        return Err(format!("{} is not reachable", bucket.display()).into());
    }
    let archiver = WalArchiver::new(client, WalCatalog::new(root.join("meta")));
    let record = archiver.archive_file(&segment, None).await?;

    let restored = root.join("restore").join(SEGMENT_NAME);
    let found = archiver
        .client()
        .download_object(&WalArchiver::<LocalFsBackend>::object_key(&record.name), &restored)
        .await?;
    if !found || tokio::fs::read(&restored).await? != data {
        return Err("restored segment does not match".into());
    }

    let lines = archiver
        .catalog()
        .records(0)?
        .map(|r| r.map(|r| r.to_line().trim_end().to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines)
}
