use std::io::{self, Write};
use std::path::Path;

use async_trait::async_trait;
use env_logger::{Builder, Env};
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::config;

/// Initialise logging to stderr, used when no log file is configured.
pub fn init_stderr(level: LevelFilter) {
    Builder::from_env(Env::default())
        .filter(None, level)
        .format_timestamp_millis()
        .init();
}

/// Hands formatted log lines to the file writer service.
pub struct ChannelWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Background service appending log lines to the configured file.
pub struct FileLogger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl FileLogger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    /// Install the global logger. Lines are buffered until the service starts.
    pub fn init_env_logger(&self) {
        let writer = ChannelWriter {
            sender: self.sender.clone(),
        };
        Builder::from_env(Env::default())
            .filter(None, self.config.level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .init();
    }

    async fn open(&self) -> io::Result<BufWriter<File>> {
        let path = Path::new(&self.config.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        Ok(BufWriter::new(file))
    }
}

#[async_trait]
impl Service for FileLogger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match self.open().await {
            Ok(file) => file,
            Err(e) => {
                eprintln!("unable to open log file {}: {e}", self.config.path);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
                data = self.receiver.recv() => {
                    let Some(data) = data else {
                        break;
                    };
                    if let Err(e) = file.write_all(&data).await {
                        eprintln!("failed to write log file: {e}");
                    }
                    // Flush whenever the queue drains so lines are not held back.
                    if self.receiver.is_empty() {
                        if let Err(e) = file.flush().await {
                            eprintln!("failed to flush log file: {e}");
                        }
                    }
                }
            }
        }

        while let Ok(data) = self.receiver.try_recv() {
            let _ = file.write_all(&data).await;
        }
        if let Err(e) = file.flush().await {
            eprintln!("failed to flush log file: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "log file writer"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
