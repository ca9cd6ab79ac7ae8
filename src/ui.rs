use crate::client::AppView;
use btcr_client::{
    connection::HandleKind,
    error::{
        NoticeKind,
        RetryAction,
    },
    sync::LoadPhase,
    units::is_amount_input,
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use crossterm::{
    event::{
        Event,
        EventStream,
        KeyCode,
        KeyEvent,
        KeyEventKind,
        KeyModifiers,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use futures::StreamExt;
use ratatui::{
    prelude::*,
    widgets::*,
};
use std::io::stdout;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserEvent {
    Quit,
    Redraw,
    Connect,
    Disconnect,
    Join,
    Claim,
    ConfirmRedeem(String),
    Refresh,
    Retry(RetryAction),
    DismissNotice,
    NextAccount,
    LockWallet,
}

pub type InputEventReceiver = EventStream;

pub fn input_event_stream() -> InputEventReceiver {
    EventStream::new()
}

pub async fn next_raw_event(events: &mut InputEventReceiver) -> Result<Event> {
    match events.next().await {
        Some(event) => Ok(event?),
        None => Err(eyre!("terminal input stream closed")),
    }
}

#[derive(Default)]
pub struct UiState {
    mode: Mode,
    terminal: Option<Terminal<CrosstermBackend<std::io::Stdout>>>,
    notice_open: bool,
    notice_retry: Option<RetryAction>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    RedeemModal(RedeemState),
    QuitModal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct RedeemState {
    input: String,
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout());
    state.terminal = Some(Terminal::new(backend)?);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

pub fn draw(state: &mut UiState, view: &AppView) -> Result<()> {
    state.notice_open = view.notice.is_some();
    state.notice_retry = view.notice.as_ref().and_then(|n| n.retry);
    if let Some(mut term) = state.terminal.take() {
        term.draw(|f| ui(f, state, view))?;
        state.terminal = Some(term);
    }
    Ok(())
}

/// Maps a terminal event to a user intent, updating modal state on the way.
pub fn interpret_event(state: &mut UiState, event: Event) -> Option<UserEvent> {
    let key = match event {
        Event::Key(key) => key,
        Event::Resize(_, _) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    if key.kind != KeyEventKind::Press {
        return None;
    }
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        return Some(UserEvent::Quit);
    }
    if state.notice_open {
        return interpret_notice_key(state, key);
    }
    match &mut state.mode {
        Mode::RedeemModal(rs) => match key.code {
            KeyCode::Esc => {
                state.mode = Mode::Normal;
                Some(UserEvent::Redraw)
            }
            KeyCode::Enter => {
                let amount = rs.input.clone();
                state.mode = Mode::Normal;
                Some(UserEvent::ConfirmRedeem(amount))
            }
            KeyCode::Backspace => {
                rs.input.pop();
                Some(UserEvent::Redraw)
            }
            KeyCode::Char(c) => {
                let mut candidate = rs.input.clone();
                candidate.push(c);
                if is_amount_input(&candidate) {
                    rs.input = candidate;
                }
                Some(UserEvent::Redraw)
            }
            _ => None,
        },
        Mode::QuitModal => match key.code {
            KeyCode::Char('y') | KeyCode::Enter => Some(UserEvent::Quit),
            KeyCode::Char('n') | KeyCode::Esc => {
                state.mode = Mode::Normal;
                Some(UserEvent::Redraw)
            }
            _ => None,
        },
        Mode::Normal => match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                state.mode = Mode::QuitModal;
                Some(UserEvent::Redraw)
            }
            KeyCode::Char('w') => Some(UserEvent::Connect),
            KeyCode::Char('x') => Some(UserEvent::Disconnect),
            KeyCode::Char('p') => Some(UserEvent::Join),
            KeyCode::Char('c') => Some(UserEvent::Claim),
            KeyCode::Char('b') => {
                state.mode = Mode::RedeemModal(RedeemState::default());
                Some(UserEvent::Redraw)
            }
            KeyCode::Char('r') => Some(UserEvent::Refresh),
            KeyCode::Char('n') => Some(UserEvent::NextAccount),
            KeyCode::Char('l') => Some(UserEvent::LockWallet),
            _ => None,
        },
    }
}

fn interpret_notice_key(state: &mut UiState, key: KeyEvent) -> Option<UserEvent> {
    match key.code {
        KeyCode::Enter | KeyCode::Esc | KeyCode::Char(' ') => {
            state.notice_open = false;
            Some(UserEvent::DismissNotice)
        }
        KeyCode::Char('r') => state.notice_retry.map(|retry| {
            state.notice_open = false;
            UserEvent::Retry(retry)
        }),
        _ => None,
    }
}

fn ui(f: &mut Frame, state: &UiState, view: &AppView) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Min(12),
            Constraint::Length(6),
            Constraint::Length(3),
        ])
        .split(f.area());

    draw_top(f, chunks[0], view);
    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[1]);
    draw_protocol(f, middle[0], view);
    draw_portfolio(f, middle[1], view);
    draw_errors(f, chunks[2], view);
    draw_help(f, chunks[3], view);
    draw_modals(f, state, view);
}

fn draw_top(f: &mut Frame, area: Rect, view: &AppView) {
    let connection = match view.connection.kind {
        HandleKind::Unconnected => "Not connected".to_owned(),
        HandleKind::ReadOnlyInjected | HandleKind::ReadOnlyPublic => {
            format!("Read-only ({})", view.connection.endpoint)
        }
        HandleKind::Signing => match view.connection.account {
            Some(account) => format!("Connected {account:?}"),
            None => "Connected".to_owned(),
        },
    };
    let activity = if let Some(pending) = &view.pending_action {
        pending.phase.status(pending.kind).to_owned()
    } else if view.manual_refresh {
        "Refreshing...".to_owned()
    } else if view.refreshing {
        "Syncing...".to_owned()
    } else {
        view.status.clone()
    };
    let text = format!(
        "{connection} | Contract {:?}\n{activity}",
        view.contract_address
    );
    let top = Paragraph::new(text).block(Block::default().borders(Borders::ALL).title("BTCR Miner"));
    f.render_widget(top, area);
}

fn draw_protocol(f: &mut Frame, area: Rect, view: &AppView) {
    let s = &view.snapshot;
    let title = match &view.phase {
        LoadPhase::InitialLoading => "Protocol (loading...)".to_owned(),
        LoadPhase::InitialError { .. } => "Protocol (load failed)".to_owned(),
        LoadPhase::Ready => "Protocol".to_owned(),
    };
    let mut lines = vec![
        Line::from(format!("Halving round:   {}", s.round)),
        Line::from(format!("Epoch:           {}", s.current_epoch_id)),
        Line::from(format!("Blocks mined:    {}", s.blocks_mined)),
        Line::from(format!("Block reward:    {} BTCR", s.block_reward)),
        Line::from(format!("Players:         {}", s.entry_count)),
        Line::from(format!("Total shares:    {}", s.share_sum)),
        Line::from(format!("Token price:     {} ETH", s.price)),
        Line::from(format!("Redemption pool: {} ETH", s.burn_fee)),
        Line::from(format!("Reward pool:     {} ETH", s.pool_fee)),
        Line::from(format!("Total supply:    {} BTCR", s.total_supply)),
        Line::from(format!("Burned:          {} BTCR", s.total_burned)),
        Line::from(format!(
            "Next block in:   {}",
            format_countdown(view.next_block_in)
        )),
    ];
    if s.is_newbee_only {
        lines.push(Line::from(Span::styled(
            "Newbie protection active: only new players may join",
            Style::default().fg(Color::Yellow),
        )));
    }
    let block = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(block, area);
}

fn draw_portfolio(f: &mut Frame, area: Rect, view: &AppView) {
    let mut lines = Vec::new();
    match &view.snapshot.user {
        Some(user) => {
            lines.push(Line::from(format!("ETH balance:     {}", user.eth_balance)));
            lines.push(Line::from(format!("BTCR balance:    {}", user.token_balance)));
            lines.push(Line::from(format!(
                "Pending reward:  {} BTCR + {} ETH",
                user.pending_token_reward, user.pending_eth_reward
            )));
            lines.push(Line::from(format!(
                "Epoch share:     {}",
                view.snapshot.current_epoch_share()
            )));
            lines.push(Line::from(format!(
                "Claimed:         {}",
                if user.claimed { "yes" } else { "no" }
            )));
            lines.push(Line::from(""));
            let join = if view.has_joined {
                Span::styled("Joined this epoch", Style::default().fg(Color::Green))
            } else {
                Span::raw("p  join for 0.001 ETH")
            };
            lines.push(Line::from(join));
            lines.push(Line::from("c  claim rewards"));
            lines.push(Line::from(format!(
                "b  redeem BTCR (pool covers up to {})",
                view.max_redeemable
            )));
        }
        None => {
            lines.push(Line::from("Connect a wallet to play."));
            if !view.connection.wallet_available {
                lines.push(Line::from(Span::styled(
                    "No keystore loaded; restart with --wallet <name>.",
                    Style::default().fg(Color::DarkGray),
                )));
            }
        }
    }
    let block = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Your Mining"));
    f.render_widget(block, area);
}

fn draw_errors(f: &mut Frame, area: Rect, view: &AppView) {
    let mut lines: Vec<Line> = Vec::new();
    if view.errors.is_empty() {
        lines.push(Line::from("No errors"));
    } else {
        let skip = view.errors.len().saturating_sub(area.height.saturating_sub(2) as usize);
        for e in view.errors.iter().skip(skip) {
            lines.push(Line::from(e.clone()));
        }
    }
    let color = if view.errors.is_empty() {
        Color::Green
    } else {
        Color::Red
    };
    let errors = Paragraph::new(lines)
        .style(Style::default().fg(color))
        .block(Block::default().borders(Borders::ALL).title("Errors"));
    f.render_widget(errors, area);
}

fn draw_help(f: &mut Frame, area: Rect, view: &AppView) {
    let wallet_keys = if view.connection.wallet_available {
        " | n next account | l lock wallet"
    } else {
        ""
    };
    let help = Paragraph::new(format!(
        "w connect | x disconnect | p join | c claim | b redeem | r refresh{wallet_keys} | q quit"
    ))
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, area);
}

fn draw_modals(f: &mut Frame, state: &UiState, view: &AppView) {
    if let Some(notice) = &view.notice {
        let area = centered_rect(60, 30, f.area());
        let color = match notice.kind {
            NoticeKind::Info => Color::Cyan,
            NoticeKind::Success => Color::Green,
            NoticeKind::Warning => Color::Yellow,
            NoticeKind::Error => Color::Red,
        };
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(color))
            .title(notice.title.clone());
        let hint = if notice.retry.is_some() {
            "r retry | Enter dismiss"
        } else {
            "Enter dismiss"
        };
        let p = Paragraph::new(vec![
            Line::from(notice.message.clone()),
            Line::from(""),
            Line::from(Span::styled(hint, Style::default().fg(Color::DarkGray))),
        ])
        .wrap(Wrap { trim: true });
        f.render_widget(Clear, area);
        f.render_widget(block.clone(), area);
        f.render_widget(p, block.inner(area));
        return;
    }
    match &state.mode {
        Mode::RedeemModal(rs) => {
            let area = centered_rect(50, 30, f.area());
            let block = Block::default()
                .borders(Borders::ALL)
                .title("Redeem BTCR");
            let balance = view
                .snapshot
                .user
                .as_ref()
                .map(|u| u.token_balance.clone())
                .unwrap_or_else(|| "0".to_owned());
            let p = Paragraph::new(vec![
                Line::from(format!("Balance: {balance} BTCR")),
                Line::from(format!("Pool covers up to: {} BTCR", view.max_redeemable)),
                Line::from(format!("Amount: {}", rs.input)),
                Line::from("Enter=confirm Esc=cancel"),
            ]);
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(p, block.inner(area));
        }
        Mode::QuitModal => {
            let area = centered_rect(30, 20, f.area());
            let block = Block::default().borders(Borders::ALL).title("Quit");
            let p = Paragraph::new("Quit the client? (y/n)");
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(p, block.inner(area));
        }
        Mode::Normal => {}
    }
}

fn format_countdown(seconds: u64) -> String {
    if seconds == 0 {
        return "any moment".to_owned();
    }
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1])[1]
}
