use crate::ui;
use btcr_client::{
    actions::{
        ActionContext,
        ActionKind,
        ActionPhase,
        ActionReport,
        ActionSequencer,
        PendingAction,
        run_action,
    },
    chain::{
        HttpConnector,
        Transport,
    },
    config::AppConfig,
    connection::{
        ConnectionManager,
        HandleKind,
        HandleSummary,
    },
    contract::MinerContract,
    error::{
        ClientError,
        Notice,
        NoticeKind,
        RetryAction,
        describe_action_error,
    },
    keystore::{
        KeystoreWallet,
        resolve_keystore_dir,
        select_keystores,
    },
    resolver::EndpointResolver,
    sync::{
        ApplyOutcome,
        ContractSnapshot,
        FetchTicket,
        FetchTrigger,
        LoadPhase,
        StateSynchronizer,
        SyncError,
        fetch_snapshot,
    },
    wallet::{
        WalletEvent,
        WalletProvider,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use ethers::types::Address;
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time,
};
use tracing::{
    error,
    info,
    warn,
};

const MAX_ERRORS: usize = 50;
const CHAIN_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the UI renders in one frame.
#[derive(Clone, Debug)]
pub struct AppView {
    pub connection: HandleSummary,
    pub contract_address: Address,
    pub snapshot: ContractSnapshot,
    pub phase: LoadPhase,
    pub refreshing: bool,
    pub manual_refresh: bool,
    pub pending_action: Option<PendingAction>,
    pub notice: Option<Notice>,
    pub status: String,
    pub errors: Vec<String>,
    pub max_redeemable: String,
    pub has_joined: bool,
    pub next_block_in: u64,
}

pub struct AppController {
    config: AppConfig,
    contract: MinerContract,
    connection: ConnectionManager,
    sync: StateSynchronizer,
    actions: ActionSequencer,
    keystore: Option<Arc<KeystoreWallet>>,
    notice: Option<Notice>,
    status: String,
    errors: Vec<String>,
}

impl AppController {
    pub fn new(config: AppConfig, keystore: Option<Arc<KeystoreWallet>>) -> Result<Self> {
        let resolver = EndpointResolver::new(config.rpc_urls.clone(), Arc::new(HttpConnector));
        let wallet = keystore
            .clone()
            .map(|k| k as Arc<dyn WalletProvider>);
        Self::with_connection(config, ConnectionManager::new(resolver, wallet), keystore)
    }

    fn with_connection(
        config: AppConfig,
        connection: ConnectionManager,
        keystore: Option<Arc<KeystoreWallet>>,
    ) -> Result<Self> {
        let contract = MinerContract::new(config.contract_address)
            .wrap_err("Failed to build contract interface")?;
        Ok(Self {
            connection,
            contract,
            sync: StateSynchronizer::new(),
            actions: ActionSequencer::default(),
            keystore,
            notice: None,
            status: "Starting...".to_owned(),
            errors: Vec::new(),
            config,
        })
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
    }

    fn push_errors(&mut self, mut items: Vec<String>) {
        if items.is_empty() {
            return;
        }
        for item in &items {
            error!("{}", item);
        }
        self.errors.append(&mut items);
        if self.errors.len() > MAX_ERRORS {
            let drain = self.errors.len() - MAX_ERRORS;
            self.errors.drain(0..drain);
        }
    }

    fn raise(&mut self, notice: Notice) {
        if notice.kind == NoticeKind::Error {
            self.push_errors(vec![notice.message.clone()]);
        }
        self.notice = Some(notice);
    }

    pub fn view(&self) -> AppView {
        let snapshot = self.sync.snapshot().clone();
        AppView {
            connection: self.connection.summary(),
            contract_address: self.contract.address(),
            phase: self.sync.phase().clone(),
            refreshing: self.sync.is_refreshing(),
            manual_refresh: self.sync.is_manual_refresh(),
            pending_action: self.actions.in_flight().cloned(),
            notice: self.notice.clone(),
            status: self.status.clone(),
            errors: self.errors.clone(),
            max_redeemable: snapshot.max_redeemable_tokens(),
            has_joined: snapshot.has_joined_current_epoch(),
            next_block_in: snapshot.seconds_until_next_block(chrono::Utc::now().timestamp()),
            snapshot,
        }
    }

    async fn initialize(&mut self) {
        self.set_status("Connecting to Ethereum...");
        match self.connection.initialize().await {
            Ok(()) => self.set_status("Connected"),
            Err(err) => {
                self.set_status("No endpoint reachable");
                self.raise(
                    Notice::error("Error", format!("Failed to initialize contract: {err}"))
                        .with_retry(RetryAction::InitializeConnection),
                );
            }
        }
    }

    async fn connect(&mut self) {
        if self.connection.handle().is_signing() {
            self.set_status("Wallet already connected");
            return;
        }
        self.set_status("Connecting wallet...");
        match self.connection.connect().await {
            Ok(account) => self.set_status(format!("Connected {account:?}")),
            Err(err) => {
                self.set_status("Wallet not connected");
                self.raise(
                    Notice::error("Error", format!("Failed to connect wallet: {err}"))
                        .with_retry(RetryAction::Connect),
                );
            }
        }
    }

    async fn disconnect(&mut self) {
        if !self.connection.handle().is_signing() {
            return;
        }
        self.connection.disconnect().await;
        self.set_status("Wallet disconnected");
    }

    async fn on_wallet_event(&mut self, event: WalletEvent) {
        info!(?event, "wallet event");
        if let Err(err) = self.connection.handle_event(event).await {
            self.raise(Notice::error("Error", err.to_string()));
        }
    }

    fn fetch_target(&self) -> Option<FetchTarget> {
        let transport = self.connection.handle().transport()?;
        Some(FetchTarget {
            transport,
            generation: self.connection.generation(),
            account: self.connection.handle().account(),
        })
    }

    fn begin_fetch(&mut self, ticket: &FetchTicket) {
        self.sync.begin(ticket);
    }

    fn apply_fetch(&mut self, ticket: FetchTicket, result: Result<ContractSnapshot, SyncError>) {
        let outcome = self.sync.apply(&ticket, result);
        if let Some(notice) = fetch_notice(ticket.trigger, &outcome) {
            self.raise(notice);
        }
        if outcome == ApplyOutcome::Applied && ticket.trigger == FetchTrigger::Manual {
            self.set_status("Data refreshed");
        }
    }

    fn start_action(
        &mut self,
        kind: ActionKind,
        amount: Option<String>,
        channels: &ActionChannels,
    ) {
        let Some(transport) = self.connection.handle().transport() else {
            self.raise(Notice::error(
                "Error",
                format!("{}: Please connect your wallet first", kind.failure_prefix()),
            ));
            return;
        };
        if kind == ActionKind::Join && self.sync.snapshot().has_joined_current_epoch() {
            self.set_status("Already joined this epoch");
            return;
        }
        let pending = match self.actions.try_begin(kind, amount) {
            Ok(pending) => pending,
            Err(err) => {
                self.set_status(err.to_string());
                return;
            }
        };
        self.set_status(kind.loading_message());
        let mut ctx = ActionContext::new(
            transport,
            self.connection.handle().signer(),
            self.contract.clone(),
            self.sync.snapshot().clone(),
        );
        ctx.settle_delay = self.config.settle_delay;
        let generation = self.connection.generation();
        let progress = channels.phase_tx.clone();
        let done = channels.done_tx.clone();
        tokio::spawn(async move {
            let result = run_action(&ctx, &pending, Some(&progress)).await;
            let _ = done.send(ActionFinished {
                kind: pending.kind,
                generation,
                result,
            });
        });
    }

    fn finish_action(&mut self, finished: ActionFinished) {
        self.actions.finish();
        let ActionFinished {
            kind,
            generation,
            result,
        } = finished;
        match result {
            Ok(ActionReport {
                tx_hash,
                account,
                resync,
            }) => {
                info!(%kind, ?tx_hash, "action completed");
                let ticket = FetchTicket {
                    generation,
                    account: Some(account),
                    trigger: FetchTrigger::Resync,
                };
                if let ApplyOutcome::Failed(err) = self.sync.apply(&ticket, resync) {
                    warn!(%err, "resync after action failed");
                }
                self.set_status(kind.success_message());
                self.raise(Notice::success("Success", kind.success_message()));
            }
            Err(err) => {
                self.set_status(format!("{} failed", capitalize(&kind.to_string())));
                self.raise(action_failure_notice(kind, &err));
            }
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Notice raised for a fetch outcome, if any. Background failures stay silent.
fn fetch_notice(trigger: FetchTrigger, outcome: &ApplyOutcome) -> Option<Notice> {
    match outcome {
        ApplyOutcome::Applied | ApplyOutcome::Stale => None,
        ApplyOutcome::NotDeployed if trigger == FetchTrigger::Background => None,
        ApplyOutcome::NotDeployed => Some(Notice::warning(
            "Contract not found",
            "No contract is deployed at the configured address.",
        )),
        ApplyOutcome::Failed(_) if trigger == FetchTrigger::Background => None,
        ApplyOutcome::Failed(err) => {
            let notice = Notice::error("Error", format!("Failed to load data: {err}"));
            Some(match trigger {
                FetchTrigger::Initial | FetchTrigger::Retry => {
                    notice.with_retry(RetryAction::InitialLoad)
                }
                _ => notice,
            })
        }
    }
}

fn action_failure_notice(kind: ActionKind, err: &ClientError) -> Notice {
    Notice::error(
        "Error",
        format!("{}: {}", kind.failure_prefix(), describe_action_error(err)),
    )
}

/// Endpoint and identity the snapshot worker polls with.
#[derive(Clone, Debug)]
struct FetchTarget {
    transport: Arc<dyn Transport>,
    generation: u64,
    account: Option<Address>,
}

impl FetchTarget {
    fn ticket(&self, trigger: FetchTrigger) -> FetchTicket {
        FetchTicket {
            generation: self.generation,
            account: self.account,
            trigger,
        }
    }
}

enum SnapshotWorkerCommand {
    Retarget(Option<FetchTarget>),
    FetchNow(FetchTrigger),
    Shutdown,
}

enum SnapshotWorkerEvent {
    Started(FetchTicket),
    Fetched {
        ticket: FetchTicket,
        result: Result<ContractSnapshot, SyncError>,
    },
}

/// Fetches run one at a time, so background polls never overlap.
async fn snapshot_worker(
    poll_interval: Duration,
    contract: MinerContract,
    mut cmd_rx: mpsc::UnboundedReceiver<SnapshotWorkerCommand>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotWorkerEvent>,
) -> Result<()> {
    async fn fetch(
        target: &FetchTarget,
        contract: &MinerContract,
        trigger: FetchTrigger,
        snapshot_tx: &mpsc::UnboundedSender<SnapshotWorkerEvent>,
    ) -> Result<()> {
        let ticket = target.ticket(trigger);
        snapshot_tx
            .send(SnapshotWorkerEvent::Started(ticket))
            .map_err(|_| eyre!("snapshot receiver dropped"))?;
        let result = fetch_snapshot(target.transport.as_ref(), contract, target.account).await;
        if let Err(err) = &result {
            warn!(?err, ?trigger, "snapshot fetch failed");
        }
        snapshot_tx
            .send(SnapshotWorkerEvent::Fetched { ticket, result })
            .map_err(|_| eyre!("snapshot receiver dropped"))
    }

    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut target: Option<FetchTarget> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(target) = &target {
                    fetch(target, &contract, FetchTrigger::Background, &snapshot_tx).await?;
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                match cmd {
                    SnapshotWorkerCommand::Retarget(next) => {
                        target = next;
                        ticker.reset();
                    }
                    SnapshotWorkerCommand::FetchNow(trigger) => {
                        if let Some(target) = &target {
                            fetch(target, &contract, trigger, &snapshot_tx).await?;
                        }
                    }
                    SnapshotWorkerCommand::Shutdown => break,
                }
            }
        }
    }
    Ok(())
}

struct ActionFinished {
    kind: ActionKind,
    generation: u64,
    result: Result<ActionReport, ClientError>,
}

struct ActionChannels {
    phase_tx: mpsc::UnboundedSender<ActionPhase>,
    done_tx: mpsc::UnboundedSender<ActionFinished>,
}

/// Points the worker at the current handle after any connection change and
/// requests the eager fetch for it.
fn sync_connection(
    controller: &mut AppController,
    snapshot_cmd_tx: &mpsc::UnboundedSender<SnapshotWorkerCommand>,
) {
    let generation = controller.connection.generation();
    let account = controller.connection.handle().account();
    if !controller.sync.on_connection_changed(generation, account) {
        return;
    }
    let target = controller.fetch_target();
    let has_target = target.is_some();
    let _ = snapshot_cmd_tx.send(SnapshotWorkerCommand::Retarget(target));
    if has_target && controller.sync.needs_eager_fetch() {
        let _ = snapshot_cmd_tx.send(SnapshotWorkerCommand::FetchNow(FetchTrigger::Initial));
    }
}

async fn next_wallet_event(
    events: &mut Option<mpsc::UnboundedReceiver<WalletEvent>>,
) -> Option<WalletEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn open_keystore(config: &AppConfig) -> Result<Option<Arc<KeystoreWallet>>> {
    let Some(wallet) = &config.wallet else {
        info!("wallet disabled");
        return Ok(None);
    };
    let dir = resolve_keystore_dir(wallet.dir.as_deref())?;
    let descriptors = select_keystores(&dir, &wallet.names)?;
    if descriptors.is_empty() {
        info!(dir = %dir.display(), "no keystores found; running read-only");
        return Ok(None);
    }
    let keystore = KeystoreWallet::unlock(&wallet.rpc_url, &descriptors)?;
    Ok(Some(Arc::new(keystore)))
}

pub async fn run_app(config: AppConfig) -> Result<()> {
    let keystore = open_keystore(&config)?;
    let watcher = keystore
        .as_ref()
        .map(|k| k.spawn_chain_watcher(CHAIN_WATCH_INTERVAL));
    let controller = AppController::new(config, keystore)?;
    let mut ui_state = ui::UiState::default();
    let mut input_events = ui::input_event_stream();

    info!("Starting UI");
    ui::terminal_enter(&mut ui_state)?;
    let res = run_loop(controller, &mut ui_state, &mut input_events).await;
    ui::terminal_exit()?;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    res
}

async fn run_loop(
    mut controller: AppController,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEventReceiver,
) -> Result<()> {
    let (snapshot_cmd_tx, snapshot_cmd_rx) = mpsc::unbounded_channel();
    let (snapshot_event_tx, mut snapshot_event_rx) = mpsc::unbounded_channel();
    let snapshot_handle = tokio::spawn(snapshot_worker(
        controller.config.poll_interval,
        controller.contract.clone(),
        snapshot_cmd_rx,
        snapshot_event_tx,
    ));
    let (phase_tx, mut phase_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let channels = ActionChannels { phase_tx, done_tx };
    let mut wallet_events = controller.connection.subscribe();
    let mut clock = time::interval(Duration::from_secs(1));

    ui::draw(ui_state, &controller.view()).wrap_err("initial draw failed")?;
    controller.initialize().await;
    sync_connection(&mut controller, &snapshot_cmd_tx);
    ui::draw(ui_state, &controller.view()).wrap_err("draw after initialize failed")?;

    loop {
        tokio::select! {
            maybe_event = snapshot_event_rx.recv() => {
                match maybe_event {
                    Some(SnapshotWorkerEvent::Started(ticket)) => controller.begin_fetch(&ticket),
                    Some(SnapshotWorkerEvent::Fetched { ticket, result }) => {
                        controller.apply_fetch(ticket, result);
                    }
                    None => {
                        warn!("snapshot worker channel closed");
                        break;
                    }
                }
            }
            Some(phase) = phase_rx.recv() => {
                controller.actions.set_phase(phase);
            }
            Some(finished) = done_rx.recv() => {
                controller.finish_action(finished);
            }
            Some(event) = next_wallet_event(&mut wallet_events) => {
                controller.on_wallet_event(event).await;
                sync_connection(&mut controller, &snapshot_cmd_tx);
            }
            _ = clock.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            raw_ev = ui::next_raw_event(input_events) => {
                let event = raw_ev?;
                let Some(ev) = ui::interpret_event(ui_state, event) else {
                    continue;
                };
                match ev {
                    ui::UserEvent::Quit => break,
                    ui::UserEvent::Redraw => {}
                    ui::UserEvent::DismissNotice => controller.notice = None,
                    ui::UserEvent::Connect => {
                        show_processing_status(&mut controller, ui_state, "Connecting wallet...")?;
                        controller.connect().await;
                        sync_connection(&mut controller, &snapshot_cmd_tx);
                    }
                    ui::UserEvent::Disconnect => {
                        controller.disconnect().await;
                        sync_connection(&mut controller, &snapshot_cmd_tx);
                    }
                    ui::UserEvent::Join => controller.start_action(ActionKind::Join, None, &channels),
                    ui::UserEvent::Claim => controller.start_action(ActionKind::Claim, None, &channels),
                    ui::UserEvent::ConfirmRedeem(amount) => {
                        controller.start_action(ActionKind::Redeem, Some(amount), &channels);
                    }
                    ui::UserEvent::Refresh => {
                        if controller.connection.handle().kind() == HandleKind::Unconnected {
                            controller.set_status("Not connected; nothing to refresh");
                        } else {
                            let _ = snapshot_cmd_tx
                                .send(SnapshotWorkerCommand::FetchNow(FetchTrigger::Manual));
                        }
                    }
                    ui::UserEvent::Retry(retry) => {
                        controller.notice = None;
                        match retry {
                            RetryAction::InitializeConnection => {
                                show_processing_status(
                                    &mut controller,
                                    ui_state,
                                    "Connecting to Ethereum...",
                                )?;
                                controller.initialize().await;
                                sync_connection(&mut controller, &snapshot_cmd_tx);
                            }
                            RetryAction::InitialLoad => {
                                let _ = snapshot_cmd_tx
                                    .send(SnapshotWorkerCommand::FetchNow(FetchTrigger::Retry));
                            }
                            RetryAction::Connect => {
                                show_processing_status(
                                    &mut controller,
                                    ui_state,
                                    "Connecting wallet...",
                                )?;
                                controller.connect().await;
                                sync_connection(&mut controller, &snapshot_cmd_tx);
                            }
                        }
                    }
                    ui::UserEvent::NextAccount => match controller.keystore.clone() {
                        Some(keystore) => keystore.select_next_account(),
                        None => controller.set_status("No keystore loaded"),
                    },
                    ui::UserEvent::LockWallet => match controller.keystore.clone() {
                        Some(keystore) => keystore.lock(),
                        None => controller.set_status("No keystore loaded"),
                    },
                }
            }
        }
        ui::draw(ui_state, &controller.view()).wrap_err("draw failed")?;
    }

    let _ = snapshot_cmd_tx.send(SnapshotWorkerCommand::Shutdown);
    controller.connection.teardown();
    match snapshot_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(?err, "snapshot worker exited with error"),
        Err(err) => warn!(?err, "snapshot worker panicked"),
    }
    Ok(())
}

fn show_processing_status(
    controller: &mut AppController,
    ui_state: &mut ui::UiState,
    message: impl Into<String>,
) -> Result<()> {
    controller.set_status(message);
    ui::draw(ui_state, &controller.view()).wrap_err("draw while processing failed")
}
