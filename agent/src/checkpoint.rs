use crate::model::Domain;
use agent_core::config::CheckpointConfig;
use agent_core::{Error, Result};
use chrono::{Local, NaiveDateTime};
use std::fs;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Durable "last successfully processed instant" per extraction domain.
///
/// Backing storage is one single-line text file per domain. The in-memory
/// cell is the only state shared between cadences for a domain; each cell
/// has its own lock so the log and database pipelines never contend.
pub struct CheckpointStore {
    dir: PathBuf,
    log_cell: Mutex<Option<NaiveDateTime>>,
    db_cell: Mutex<Option<NaiveDateTime>>,
    log_default: NaiveDateTime,
    db_default: NaiveDateTime,
}

impl CheckpointStore {
    pub fn new(config: &CheckpointConfig) -> Result<Self> {
        let log_default = Domain::Log
            .time_format()
            .parse(&config.log_default)
            .map_err(|e| Error::Config(format!("checkpoint.log_default: {e}")))?;
        let db_default = Domain::Db
            .time_format()
            .parse(&config.db_default)
            .map_err(|e| Error::Config(format!("checkpoint.db_default: {e}")))?;

        let dir = PathBuf::from(&config.dir);
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            log_cell: Mutex::new(None),
            db_cell: Mutex::new(None),
            log_default,
            db_default,
        })
    }

    fn cell(&self, domain: Domain) -> &Mutex<Option<NaiveDateTime>> {
        match domain {
            Domain::Log => &self.log_cell,
            Domain::Db => &self.db_cell,
        }
    }

    fn default_for(&self, domain: Domain) -> NaiveDateTime {
        match domain {
            Domain::Log => self.log_default,
            Domain::Db => self.db_default,
        }
    }

    fn file_path(&self, domain: Domain) -> PathBuf {
        self.dir.join(domain.checkpoint_file())
    }

    /// Returns the last durably recorded instant for `domain`, falling back
    /// to the configured default (and re-initializing the backing file) when
    /// the record is absent, unreadable, or malformed. Never fails.
    pub async fn load(&self, domain: Domain) -> NaiveDateTime {
        let mut cell = self.cell(domain).lock().await;
        if let Some(value) = *cell {
            return value;
        }
        let value = self.read_or_reset(domain);
        *cell = Some(value);
        value
    }

    /// Advances the checkpoint to `candidate`, never backward. A candidate
    /// at or before the current value leaves both the file and the cached
    /// cell untouched.
    pub async fn commit(&self, domain: Domain, candidate: NaiveDateTime) -> Result<()> {
        let mut cell = self.cell(domain).lock().await;
        let current = match *cell {
            Some(value) => value,
            None => self.read_or_reset(domain),
        };

        if candidate <= current {
            debug!(
                domain = %domain,
                candidate = %domain.time_format().format(candidate),
                current = %domain.time_format().format(current),
                "Candidate does not advance checkpoint, keeping current value"
            );
            *cell = Some(current);
            return Ok(());
        }

        self.write(domain, candidate)?;
        *cell = Some(candidate);

        info!(
            domain = %domain,
            checkpoint = %domain.time_format().format(candidate),
            "Committed checkpoint"
        );
        Ok(())
    }

    /// Advances the checkpoint to the current instant. Used by the database
    /// pipeline, whose committed value is the batch completion time rather
    /// than a record watermark.
    pub async fn commit_now(&self, domain: Domain) -> Result<NaiveDateTime> {
        let now = Local::now().naive_local();
        self.commit(domain, now).await?;
        Ok(now)
    }

    /// Explicit reset back to the default epoch, the only sanctioned
    /// backward move.
    pub async fn reset(&self, domain: Domain) -> Result<()> {
        let mut cell = self.cell(domain).lock().await;
        let default = self.default_for(domain);
        self.write(domain, default)?;
        *cell = Some(default);
        warn!(domain = %domain, "Checkpoint reset to default epoch");
        Ok(())
    }

    /// Reads the backing file, requiring exactly one line that parses under
    /// the domain's format. Anything else rewrites the file to the default
    /// so that subsequent loads agree.
    fn read_or_reset(&self, domain: Domain) -> NaiveDateTime {
        let path = self.file_path(domain);
        let default = self.default_for(domain);
        let format = domain.time_format();

        let reset = |reason: &str| {
            warn!(
                domain = %domain,
                path = %path.display(),
                reason,
                "Checkpoint file unusable, re-initializing to default"
            );
            if let Err(e) = self.write(domain, default) {
                error!(domain = %domain, error = %e, "Failed to re-initialize checkpoint file");
            }
            default
        };

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => return reset(&format!("read failed: {e}")),
        };

        let mut lines = contents.lines();
        let first = match lines.next() {
            Some(first) => first.trim(),
            None => return reset("empty file"),
        };
        if lines.next().is_some() {
            return reset("more than one line");
        }

        match format.parse(first) {
            Ok(value) => value,
            Err(e) => reset(&format!("parse failed: {e}")),
        }
    }

    /// Overwrites the single-line record atomically (write temp + rename).
    fn write(&self, domain: Domain, value: NaiveDateTime) -> Result<()> {
        let path = self.file_path(domain);
        let tmp = path.with_extension("tmp");
        let line = domain.time_format().format(value);

        fs::write(&tmp, format!("{line}\n"))
            .map_err(|e| Error::Checkpoint(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::Checkpoint(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    #[cfg(test)]
    fn raw_file(&self, domain: Domain) -> Option<String> {
        fs::read_to_string(self.file_path(domain)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(&CheckpointConfig {
            dir: dir.to_string_lossy().into_owned(),
            log_default: "01-Jan-2020 00:00:00.000".to_string(),
            db_default: "2021-01-01 00:00:00.000000".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn missing_file_loads_default_and_initializes_backing_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        let loaded = store.load(Domain::Log).await;
        assert_eq!(Domain::Log.time_format().format(loaded), "01-Jan-2020 00:00:00.000");
        assert_eq!(
            store.raw_file(Domain::Log).unwrap(),
            "01-Jan-2020 00:00:00.000\n"
        );
    }

    #[tokio::test]
    async fn garbage_file_resets_to_default() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("log_last_run"), "not-a-date\n").unwrap();
        let store = store(tmp.path());

        let loaded = store.load(Domain::Log).await;
        assert_eq!(Domain::Log.time_format().format(loaded), "01-Jan-2020 00:00:00.000");
        assert_eq!(
            store.raw_file(Domain::Log).unwrap(),
            "01-Jan-2020 00:00:00.000\n"
        );
    }

    #[tokio::test]
    async fn multi_line_file_resets_to_default() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("db_last_run"),
            "2024-01-01 00:00:00.000000\n2024-01-02 00:00:00.000000\n",
        )
        .unwrap();
        let store = store(tmp.path());

        let loaded = store.load(Domain::Db).await;
        assert_eq!(
            Domain::Db.time_format().format(loaded),
            "2021-01-01 00:00:00.000000"
        );
    }

    #[tokio::test]
    async fn commit_is_monotone() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let fmt = Domain::Log.time_format();

        let later = fmt.parse("05-Mar-2024 12:00:00.000").unwrap();
        let earlier = fmt.parse("04-Mar-2024 12:00:00.000").unwrap();

        store.commit(Domain::Log, later).await.unwrap();
        assert_eq!(store.load(Domain::Log).await, later);

        // An earlier candidate never moves the checkpoint backward.
        store.commit(Domain::Log, earlier).await.unwrap();
        assert_eq!(store.load(Domain::Log).await, later);
        assert_eq!(
            store.raw_file(Domain::Log).unwrap(),
            "05-Mar-2024 12:00:00.000\n"
        );
    }

    #[tokio::test]
    async fn domains_have_independent_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        let log_ts = Domain::Log.time_format().parse("05-Mar-2024 12:00:00.000").unwrap();
        store.commit(Domain::Log, log_ts).await.unwrap();

        let db_loaded = store.load(Domain::Db).await;
        assert_eq!(
            Domain::Db.time_format().format(db_loaded),
            "2021-01-01 00:00:00.000000"
        );
    }

    #[tokio::test]
    async fn reset_is_the_only_backward_move() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let fmt = Domain::Log.time_format();

        let later = fmt.parse("05-Mar-2024 12:00:00.000").unwrap();
        store.commit(Domain::Log, later).await.unwrap();

        store.reset(Domain::Log).await.unwrap();
        assert_eq!(
            fmt.format(store.load(Domain::Log).await),
            "01-Jan-2020 00:00:00.000"
        );
    }
}
