use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::broker::job::Priority;
use crate::error::{BrokerError, Result};
use crate::queue::{QueueAdapter, QueueRecord};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Add {
        unique: Vec<u8>,
        function: Vec<u8>,
        data: Vec<u8>,
        priority: Priority,
    },
    Done {
        unique: Vec<u8>,
        function: Vec<u8>,
    },
}

/// Append-only persistent queue: one JSON record per line, `done` written as
/// a tombstone. The log is compacted down to the surviving records during
/// startup replay.
pub struct FileQueue {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut line =
            serde_json::to_vec(entry).map_err(|err| BrokerError::Queue(err.to_string()))?;
        line.push(b'\n');

        let mut file = self.lock_file()?;
        file.write_all(&line)?;
        Ok(())
    }

    fn lock_file(&self) -> Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| BrokerError::Queue("queue log lock poisoned".to_string()))
    }

    /// Fold the log into the records still outstanding, in first-add order.
    fn load(&self) -> Result<Vec<QueueRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);

        let mut records: Vec<((Vec<u8>, Vec<u8>), QueueRecord)> = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            let entry: LogEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                // A torn final line means the process died mid-append; the
                // record never committed, so drop it. Anywhere else the log
                // is corrupt.
                Err(err) if index == last => {
                    tracing::warn!(path = %self.path.display(), error = %err, "Dropping torn final queue record");
                    break;
                }
                Err(err) => {
                    return Err(BrokerError::Queue(format!(
                        "corrupt queue log {} at line {}: {}",
                        self.path.display(),
                        index + 1,
                        err
                    )));
                }
            };

            match entry {
                LogEntry::Add {
                    unique,
                    function,
                    data,
                    priority,
                } => {
                    let key = (function.clone(), unique.clone());
                    records.retain(|(k, _)| *k != key);
                    records.push((
                        key,
                        QueueRecord {
                            unique: Bytes::from(unique),
                            function: Bytes::from(function),
                            data: Bytes::from(data),
                            priority,
                        },
                    ));
                }
                LogEntry::Done { unique, function } => {
                    let key = (function, unique);
                    records.retain(|(k, _)| *k != key);
                }
            }
        }

        Ok(records.into_iter().map(|(_, record)| record).collect())
    }
}

impl QueueAdapter for FileQueue {
    fn add(&self, record: &QueueRecord) -> Result<()> {
        self.append(&LogEntry::Add {
            unique: record.unique.to_vec(),
            function: record.function.to_vec(),
            data: record.data.to_vec(),
            priority: record.priority,
        })
    }

    fn flush(&self) -> Result<()> {
        let file = self.lock_file()?;
        file.sync_data()?;
        Ok(())
    }

    fn done(&self, unique: &[u8], function: &[u8]) -> Result<()> {
        self.append(&LogEntry::Done {
            unique: unique.to_vec(),
            function: function.to_vec(),
        })?;
        self.flush()
    }

    fn replay(&self, add: &mut dyn FnMut(QueueRecord) -> Result<()>) -> Result<()> {
        let records = self.load()?;

        // Compact: rewrite the log as just the surviving records.
        {
            let mut file = self.lock_file()?;
            file.set_len(0)?;
            for record in &records {
                let entry = LogEntry::Add {
                    unique: record.unique.to_vec(),
                    function: record.function.to_vec(),
                    data: record.data.to_vec(),
                    priority: record.priority,
                };
                let mut line = serde_json::to_vec(&entry)
                    .map_err(|err| BrokerError::Queue(err.to_string()))?;
                line.push(b'\n');
                file.write_all(&line)?;
            }
            file.sync_data()?;
        }

        for record in records {
            add(record)?;
        }
        Ok(())
    }
}
