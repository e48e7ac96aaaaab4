//! Harbor Host
//!
//! Runs one offline worker generation against a configured origin. Events
//! arrive on stdin as JSON lines; outcomes, worker state changes and
//! messages posted to connected clients are written to stdout as JSON lines.
//! Logs go to stderr.

mod protocol;
mod setup;

use std::path::PathBuf;
use std::sync::Arc;

use harbor_common::{init_logging, HarborError, LogConfig, LogFormat};
use harbor_core::{HostResult, ProxyConfig};
use harbor_net::{Fetcher, ResourceLoader};
use harbor_sw::{
    ClientId, ClientMessage, ClientRegistry, ClientType, EventOutcome, FetchEvent, InMemoryClients, LifecycleEvent,
    MemoryCacheStorage, OfflineWorker, RecordingNotifications,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use protocol::{HostEvent, HostOutput};

/// Parse command line arguments
struct Args {
    config: Option<PathBuf>,
    log_format: LogFormat,
    log_filter: Option<String>,
    verbose: bool,
}

impl Args {
    fn parse() -> HostResult<Self> {
        let mut args = std::env::args().skip(1);
        let mut config = None;
        let mut log_format = LogFormat::Pretty;
        let mut log_filter = None;
        let mut verbose = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config = args.next().map(PathBuf::from);
                }
                "--log-format" => {
                    if let Some(val) = args.next() {
                        log_format = val.parse()?;
                    }
                }
                "--log-filter" => {
                    log_filter = args.next();
                }
                "--verbose" | "-v" => {
                    verbose = true;
                }
                _ => {}
            }
        }

        Ok(Self {
            config,
            log_format,
            log_filter,
            verbose,
        })
    }

    fn log_config(&self) -> LogConfig {
        let base = if self.verbose {
            LogConfig::debug()
        } else if self.log_format == LogFormat::Json {
            LogConfig::production()
        } else {
            LogConfig::default()
        };
        let config = base.with_format(self.log_format);
        match self.log_filter {
            Some(ref filter) => config.with_filter(filter.clone()),
            None => config,
        }
    }
}

/// Handles shared with the tasks that run events.
#[derive(Clone)]
struct Dispatcher {
    worker: Arc<OfflineWorker>,
    loader: Arc<ResourceLoader>,
    out: mpsc::UnboundedSender<HostOutput>,
}

impl Dispatcher {
    fn emit(&self, output: HostOutput) {
        let _ = self.out.send(output);
    }

    async fn dispatch(&self, event: LifecycleEvent) {
        // Kept for the passthrough fetch below; the worker takes ownership.
        let passthrough = match event {
            LifecycleEvent::Fetch(ref fetch) => Some(fetch.clone()),
            _ => None,
        };

        match self.worker.handle_event(event).await {
            Ok(EventOutcome::Passthrough) => match passthrough {
                Some(fetch) => self.fetch_directly(fetch).await,
                None => self.emit(HostOutput::Ignored),
            },
            Ok(outcome) => self.emit(outcome.into()),
            Err(e) => {
                let err = HarborError::from(e);
                error!(
                    category = err.category(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "Worker event failed"
                );
                self.emit(HostOutput::error(err));
            }
        }
    }

    async fn fetch_directly(&self, fetch: FetchEvent) {
        match self.loader.fetch(fetch.request).await {
            Ok(response) => self.emit(HostOutput::response(&response, "passthrough")),
            Err(e) => self.emit(HostOutput::error(e)),
        }
    }

    async fn check_for_update(&self) {
        let check = self.worker.check_for_update().await;
        self.emit(check.into());
    }
}

/// Install and activate change what every later event sees, so they wait
/// for earlier events and run alone. Everything else runs concurrently.
fn runs_in_order(event: &LifecycleEvent) -> bool {
    matches!(event, LifecycleEvent::Install | LifecycleEvent::Activate)
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(done) = tasks.try_join_next() {
        log_task_result(done);
    }
}

fn log_task_result(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        warn!(error = %e, "Host task ended abnormally");
    }
}

/// Everything the event loop needs.
struct Host {
    dispatcher: Dispatcher,
    clients: Arc<InMemoryClients>,
    origin: Url,
    in_flight: JoinSet<()>,
    forwarders: JoinSet<()>,
}

impl Host {
    fn new(config: &ProxyConfig, out: mpsc::UnboundedSender<HostOutput>) -> HostResult<Self> {
        let worker_config = setup::worker_config(config)?;
        let loader = Arc::new(
            ResourceLoader::new(setup::loader_config(config)?)
                .map_err(|e| anyhow::anyhow!("failed to build network loader: {e}"))?,
        );
        let clients = Arc::new(InMemoryClients::new());
        let origin = worker_config.origin.clone();

        let (worker, mut worker_events) = OfflineWorker::new(
            worker_config,
            Arc::new(MemoryCacheStorage::new()),
            loader.clone(),
            clients.clone(),
            Arc::new(RecordingNotifications::new()),
        );

        let mut forwarders = JoinSet::new();
        let events_out = out.clone();
        forwarders.spawn(async move {
            while let Some(event) = worker_events.recv().await {
                let _ = events_out.send(event.into());
            }
        });

        Ok(Self {
            dispatcher: Dispatcher {
                worker: Arc::new(worker),
                loader,
                out,
            },
            clients,
            origin,
            in_flight: JoinSet::new(),
            forwarders,
        })
    }

    fn emit(&self, output: HostOutput) {
        self.dispatcher.emit(output);
    }

    /// Handle one input line. Returns false once the host should stop.
    async fn handle_line(&mut self, line: &str) -> bool {
        let event = match HostEvent::parse(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Unreadable input line");
                self.emit(HostOutput::error(e));
                return true;
            }
        };
        debug!(?event, "Host event");

        match event {
            HostEvent::Shutdown => return false,
            HostEvent::Connect { url } => self.connect(&url).await,
            HostEvent::Disconnect { client_id } => {
                reap(&mut self.forwarders);
                if self.clients.disconnect(&client_id).await.is_some() {
                    self.emit(HostOutput::Disconnected { client_id });
                } else {
                    self.emit(HostOutput::error(format!("unknown client {client_id}")));
                }
            }
            HostEvent::CheckUpdate => {
                let dispatcher = self.dispatcher.clone();
                self.spawn(async move { dispatcher.check_for_update().await });
            }
            other => match other.into_lifecycle(&self.origin) {
                Ok(Some(event)) if runs_in_order(&event) => {
                    self.settle().await;
                    self.dispatcher.dispatch(event).await;
                }
                Ok(Some(event)) => {
                    let dispatcher = self.dispatcher.clone();
                    self.spawn(async move { dispatcher.dispatch(event).await });
                }
                Ok(None) => self.emit(HostOutput::Ignored),
                Err(e) => self.emit(HostOutput::error(e)),
            },
        }
        true
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        reap(&mut self.in_flight);
        self.in_flight.spawn(task);
    }

    /// Wait for every event already running.
    async fn settle(&mut self) {
        while let Some(done) = self.in_flight.join_next().await {
            log_task_result(done);
        }
    }

    async fn connect(&mut self, url: &str) {
        let url = match self.origin.join(url) {
            Ok(url) => url,
            Err(e) => {
                self.emit(HostOutput::error(e));
                return;
            }
        };
        let (client_id, rx) = self.clients.connect(url, ClientType::Window).await;
        self.emit(HostOutput::Connected {
            client_id: client_id.clone(),
        });

        self.forward(client_id, rx);
    }

    /// Echo everything posted to a client onto stdout.
    fn forward(&mut self, client_id: ClientId, mut rx: mpsc::UnboundedReceiver<ClientMessage>) {
        reap(&mut self.forwarders);
        let out = self.dispatcher.out.clone();
        self.forwarders.spawn(async move {
            while let Some(message) = rx.recv().await {
                let _ = out.send(HostOutput::ClientMessage {
                    client_id: client_id.clone(),
                    message,
                });
            }
        });
    }

    /// Pick up windows the worker opened on its own so their messages reach
    /// stdout too.
    async fn forward_opened_windows(&mut self) {
        for client in self.clients.clients().await {
            if let Some(rx) = self.clients.take_opened(&client.id).await {
                self.forward(client.id, rx);
            }
        }
    }

    async fn shutdown(mut self) {
        self.settle().await;
        let failed = self.dispatcher.worker.shutdown().await;
        if failed > 0 {
            warn!(failed, "Some background cache writes failed");
        }
        self.forwarders.shutdown().await;
    }
}

async fn write_outputs(mut rx: mpsc::UnboundedReceiver<HostOutput>) -> HostResult<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(output) = rx.recv().await {
        let mut line = output.to_line()?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn run(config: ProxyConfig) -> HostResult<()> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_outputs(out_rx));

    let mut host = Host::new(&config, out_tx)?;
    info!(
        version = %config.version,
        origin = %config.origin,
        cache = %config.cache_name(),
        "Harbor host ready"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !host.handle_line(line).await {
            break;
        }
        host.forward_opened_windows().await;
    }

    host.shutdown().await;
    writer
        .await
        .map_err(|e| anyhow::anyhow!("output writer failed: {e}"))??;
    info!("Harbor host stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse()?;
    init_logging(args.log_config());

    let config = match args.config {
        Some(ref path) => ProxyConfig::load(path)?,
        None => {
            let config = ProxyConfig::default();
            config.validate()?;
            config
        }
    };
    info!(config = ?args.config, verbose = args.verbose, "Starting Harbor host");

    run(config).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn host_for(server: &MockServer) -> (Host, mpsc::UnboundedReceiver<HostOutput>) {
        let config = ProxyConfig {
            origin: server.uri(),
            ..Default::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (Host::new(&config, tx).unwrap(), rx)
    }

    async fn next_response(rx: &mut mpsc::UnboundedReceiver<HostOutput>) -> String {
        loop {
            match rx.recv().await {
                Some(HostOutput::Response { url, .. }) => return url,
                Some(_) => continue,
                None => panic!("host output closed"),
            }
        }
    }

    #[test]
    fn test_only_install_and_activate_run_in_order() {
        assert!(runs_in_order(&LifecycleEvent::Install));
        assert!(runs_in_order(&LifecycleEvent::Activate));
        assert!(!runs_in_order(&LifecycleEvent::Sync { tag: "outbox".into() }));
        assert!(!runs_in_order(&LifecycleEvent::Push { payload: None }));
    }

    #[tokio::test]
    async fn test_slow_fetch_does_not_hold_up_later_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fast"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fast"))
            .mount(&server)
            .await;
        let (mut host, mut rx) = host_for(&server).await;

        assert!(host.handle_line(r#"{"event":"fetch","url":"/slow"}"#).await);
        assert!(host.handle_line(r#"{"event":"fetch","url":"/fast"}"#).await);

        let first = tokio::time::timeout(Duration::from_secs(1), next_response(&mut rx))
            .await
            .expect("second fetch waited for the first");
        assert!(first.ends_with("/fast"));

        host.shutdown().await;
        assert!(next_response(&mut rx).await.ends_with("/slow"));
    }

    #[tokio::test]
    async fn test_finished_forwarders_are_reaped() {
        let server = MockServer::start().await;
        let (mut host, mut rx) = host_for(&server).await;

        for _ in 0..3 {
            host.connect("/").await;
            let client_id = loop {
                match rx.recv().await {
                    Some(HostOutput::Connected { client_id }) => break client_id,
                    Some(_) => continue,
                    None => panic!("host output closed"),
                }
            };
            host.handle_line(&format!(r#"{{"event":"disconnect","client_id":"{client_id}"}}"#))
                .await;
        }

        // let the disconnected forwarders see their channels close
        tokio::time::sleep(Duration::from_millis(50)).await;

        // worker events plus one live client
        host.connect("/").await;
        assert_eq!(host.forwarders.len(), 2);
        host.shutdown().await;
    }
}
