use std::{
    env,
    fs::{self, File},
    path::PathBuf,
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use crossterm::{
    event::{self, Event as CEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use directories::ProjectDirs;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Terminal,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

// ---------- Data models ----------

const WELCOME_TEXT: &str = "Hello! I'm your AI assistant. Ask me anything.";
const CHAR_LIMIT: usize = 1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Sender {
    User,
    Bot,
    System,
}

#[derive(Clone, Debug)]
struct Message {
    sender: Sender,
    content: String,
    timestamp: String,
    response_time: Option<String>,
    model: Option<String>,
}

impl Message {
    fn user(content: String, timestamp: String) -> Self {
        Self { sender: Sender::User, content, timestamp, response_time: None, model: None }
    }

    fn bot(content: String, timestamp: String) -> Self {
        Self { sender: Sender::Bot, content, timestamp, response_time: None, model: None }
    }

    // metadata fields are only ever set here, on a successful reply
    fn reply(content: String, timestamp: String, response_time: Option<String>, model: Option<String>) -> Self {
        Self { sender: Sender::Bot, content, timestamp, response_time, model }
    }

    fn system(content: String, timestamp: String) -> Self {
        Self { sender: Sender::System, content, timestamp, response_time: None, model: None }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Normal,
    Insert,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Focus {
    Models,
    Chat,
}

// ---------- Config ----------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct AppConfig {
    api_url: Option<String>,
    model: Option<String>,
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "example", "tuichat").ok_or_else(|| anyhow!("unable to resolve project dirs"))
}

fn config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

fn load_config(path: &PathBuf) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let s = fs::read_to_string(path).with_context(|| "read config".to_string())?;
    let cfg: AppConfig = toml::from_str(&s).with_context(|| "parse TOML".to_string())?;
    Ok(cfg)
}

// Logs go to a file; writing to stdout/stderr would corrupt the UI.
fn init_logging() -> Result<()> {
    let dir = project_dirs()?.data_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| "create data dir".to_string())?;
    let file = File::create(dir.join("tuichat.log")).with_context(|| "create log file".to_string())?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

// ---------- Chat service API ----------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    response_time: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct ModelCatalog {
    models: Vec<String>,
    current_model: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ServiceStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

impl ServiceStatus {
    fn from_status(status: Option<&str>) -> Self {
        match status {
            Some("healthy") => ServiceStatus::Healthy,
            Some("unhealthy") => ServiceStatus::Unhealthy,
            _ => ServiceStatus::Unreachable,
        }
    }

    fn indicator(self) -> (Color, &'static str) {
        match self {
            ServiceStatus::Healthy => (Color::Green, "service healthy"),
            ServiceStatus::Unhealthy => (Color::Red, "service unhealthy"),
            ServiceStatus::Unreachable => (Color::DarkGray, "service unreachable"),
        }
    }
}

#[derive(Clone)]
struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(base: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .with_context(|| "build http client".to_string())?;
        Ok(Self { http, base })
    }

    // Bodies are parsed regardless of HTTP status: the service reports
    // failures as JSON with success=false, not as error statuses.
    async fn chat(&self, message: &str, model: &str) -> Result<ChatResponse> {
        let resp = self
            .http
            .post(format!("{}/api/chat", self.base))
            .json(&ChatRequest { message, model })
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    async fn health(&self) -> Result<HealthResponse> {
        let resp = self.http.get(format!("{}/api/health", self.base)).send().await?;
        Ok(resp.json().await?)
    }

    async fn models(&self) -> Result<ModelCatalog> {
        let resp = self.http.get(format!("{}/api/models", self.base)).send().await?;
        Ok(resp.json().await?)
    }
}

#[derive(Clone, Debug)]
enum ChatOutcome {
    Reply { reply: String, timestamp: String, response_time: Option<String>, model: Option<String> },
    Refused { error: String, timestamp: Option<String> },
    Transport(String),
}

struct OutboundChat {
    message: String,
    model: String,
}

// Always delivers exactly one ChatDone, whatever happens to the request.
async fn dispatch_chat(api: ApiClient, out: OutboundChat, tx: UnboundedSender<AppEvent>) {
    let started = Instant::now();
    let outcome = match api.chat(&out.message, &out.model).await {
        Ok(resp) if resp.success => ChatOutcome::Reply {
            reply: resp.reply.unwrap_or_default(),
            timestamp: resp.timestamp.unwrap_or_else(now_label),
            response_time: resp.response_time,
            model: resp.model,
        },
        Ok(resp) => ChatOutcome::Refused {
            error: resp.error.unwrap_or_else(|| "unknown error".to_string()),
            timestamp: resp.timestamp,
        },
        Err(e) => ChatOutcome::Transport(e.to_string()),
    };
    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "chat request settled");
    let _ = tx.send(AppEvent::ChatDone(outcome));
}

async fn fetch_health(api: ApiClient, tx: UnboundedSender<AppEvent>) {
    let status = match api.health().await {
        Ok(h) => ServiceStatus::from_status(h.status.as_deref()),
        Err(e) => {
            warn!(error = %e, "health check failed");
            ServiceStatus::Unreachable
        }
    };
    let _ = tx.send(AppEvent::Health(status));
}

// A failed fetch emits nothing: the model panel keeps its prior state.
async fn fetch_models(api: ApiClient, tx: UnboundedSender<AppEvent>) {
    match api.models().await {
        Ok(catalog) => {
            let _ = tx.send(AppEvent::Models(catalog));
        }
        Err(e) => warn!(error = %e, "model list fetch failed"),
    }
}

// ---------- Markup ----------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Inline {
    Plain,
    Strong,
    Emph,
    Code,
}

struct Markup {
    strong: Regex,
    emph: Regex,
    code: Regex,
}

impl Markup {
    fn new() -> Self {
        Self {
            strong: Regex::new(r"\*\*(.*?)\*\*").unwrap(),
            emph: Regex::new(r"\*(.*?)\*").unwrap(),
            code: Regex::new(r"`(.*?)`").unwrap(),
        }
    }

    // Passes run in a fixed order: strong, emphasis, code. A later pass only
    // sees still-plain segments, so delimiters inside a code span may already
    // have been claimed by an earlier pass and the backticks stay literal.
    fn line_spans(&self, line: &str) -> Vec<Span<'static>> {
        let mut chunks: Vec<(String, Inline)> = vec![(line.to_string(), Inline::Plain)];
        for (re, kind) in [
            (&self.strong, Inline::Strong),
            (&self.emph, Inline::Emph),
            (&self.code, Inline::Code),
        ] {
            chunks = split_pass(chunks, re, kind);
        }
        chunks
            .into_iter()
            .filter(|(text, _)| !text.is_empty())
            .map(|(text, kind)| Span::styled(text, inline_style(kind)))
            .collect()
    }

    fn render(&self, content: &str) -> Vec<Line<'static>> {
        content.split('\n').map(|line| Line::from(self.line_spans(line))).collect()
    }
}

fn split_pass(chunks: Vec<(String, Inline)>, re: &Regex, kind: Inline) -> Vec<(String, Inline)> {
    let mut out = Vec::with_capacity(chunks.len());
    for (text, existing) in chunks {
        if existing != Inline::Plain {
            out.push((text, existing));
            continue;
        }
        let mut last = 0;
        for caps in re.captures_iter(&text) {
            let m = caps.get(0).unwrap();
            if m.start() > last {
                out.push((text[last..m.start()].to_string(), Inline::Plain));
            }
            out.push((caps.get(1).map(|g| g.as_str()).unwrap_or("").to_string(), kind));
            last = m.end();
        }
        if last < text.len() {
            out.push((text[last..].to_string(), Inline::Plain));
        }
    }
    out
}

fn inline_style(kind: Inline) -> Style {
    match kind {
        Inline::Plain => Style::default(),
        Inline::Strong => Style::default().add_modifier(Modifier::BOLD),
        Inline::Emph => Style::default().add_modifier(Modifier::ITALIC),
        Inline::Code => Style::default().fg(Color::Cyan),
    }
}

// ---------- Transcript ----------

struct Transcript {
    messages: Vec<Message>,
    typing: bool,
}

impl Transcript {
    fn new(timestamp: String) -> Self {
        Self { messages: vec![Message::bot(WELCOME_TEXT.to_string(), timestamp)], typing: false }
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn show_typing(&mut self) {
        self.typing = true;
    }

    fn hide_typing(&mut self) {
        self.typing = false;
    }

    // Keeps messages[0] (the welcome entry) by identity and re-stamps it.
    fn clear_preserving_welcome(&mut self, timestamp: String) {
        self.messages.truncate(1);
        if let Some(welcome) = self.messages.first_mut() {
            welcome.timestamp = timestamp;
        }
    }
}

// ---------- Session ----------

struct Session {
    current_model: String,
    waiting: bool,
}

// ---------- App state ----------

struct App {
    session: Session,
    transcript: Transcript,
    markup: Markup,
    models: Vec<String>,
    model_idx: usize,
    service: ServiceStatus,
    api: ApiClient,
    input: String,
    chat_scroll: u16,
    max_scroll: u16,
    follow: bool,
    confirm_clear: bool,
    tick_count: u64,
    quit: bool,
    mode: Mode,
    focus: Focus,
}

impl App {
    fn new(model: String, api: ApiClient) -> Self {
        Self {
            session: Session { current_model: model, waiting: false },
            transcript: Transcript::new(now_label()),
            markup: Markup::new(),
            models: Vec::new(),
            model_idx: 0,
            service: ServiceStatus::Unreachable,
            api,
            input: String::new(),
            chat_scroll: 0,
            max_scroll: 0,
            follow: true,
            confirm_clear: false,
            tick_count: 0,
            quit: false,
            mode: Mode::Normal,
            focus: Focus::Chat,
        }
    }

    fn append(&mut self, message: Message) {
        self.transcript.push(message);
        self.follow = true;
    }

    // Blank input or an outstanding request makes this a silent no-op.
    // The returned payload captures the model at submit time.
    fn begin_send(&mut self) -> Option<OutboundChat> {
        let text = self.input.trim().to_string();
        if text.is_empty() || self.session.waiting {
            return None;
        }
        self.append(Message::user(text.clone(), now_label()));
        self.input.clear();
        self.session.waiting = true;
        self.transcript.show_typing();
        Some(OutboundChat { message: text, model: self.session.current_model.clone() })
    }

    // Runs once per dispatched request; resets state on every branch.
    fn finish_send(&mut self, outcome: ChatOutcome) {
        self.transcript.hide_typing();
        let message = match outcome {
            ChatOutcome::Reply { reply, timestamp, response_time, model } => {
                Message::reply(reply, timestamp, response_time, model)
            }
            ChatOutcome::Refused { error, timestamp } => {
                Message::bot(format!("Error: {error}"), timestamp.unwrap_or_else(now_label))
            }
            ChatOutcome::Transport(error) => {
                Message::bot(format!("Network error: {error}"), now_label())
            }
        };
        self.append(message);
        self.session.waiting = false;
    }

    fn switch_model(&mut self, model: String) {
        if model == self.session.current_model {
            return;
        }
        self.session.current_model = model.clone();
        self.append(Message::system(format!("Switched to model: {model}"), now_label()));
    }

    fn apply_catalog(&mut self, catalog: ModelCatalog) {
        self.model_idx = catalog.models.iter().position(|m| *m == catalog.current_model).unwrap_or(0);
        self.session.current_model = catalog.current_model;
        self.models = catalog.models;
    }

    fn request_clear(&mut self) {
        self.confirm_clear = true;
    }

    fn clear_conversation(&mut self) {
        self.confirm_clear = false;
        self.transcript.clear_preserving_welcome(now_label());
        self.append(Message::system("Conversation history cleared".to_string(), now_label()));
    }

    fn scroll_up(&mut self) {
        self.follow = false;
        self.chat_scroll = self.chat_scroll.saturating_sub(1);
    }

    fn scroll_down(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_add(1).min(self.max_scroll);
        if self.chat_scroll >= self.max_scroll {
            self.follow = true;
        }
    }
}

// ---------- Events ----------

#[derive(Debug)]
enum AppEvent {
    Tick,
    Input(KeyEvent),
    ChatDone(ChatOutcome),
    Health(ServiceStatus),
    Models(ModelCatalog),
}

// ---------- UI ----------

fn draw_ui(frame: &mut ratatui::Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
        .split(frame.size());
    draw_models(frame, chunks[0], app);
    draw_chat(frame, chunks[1], app);
}

fn draw_models(frame: &mut ratatui::Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = if app.models.is_empty() {
        vec![ListItem::new(Line::from(Span::styled(
            "no models loaded",
            Style::default().fg(Color::DarkGray),
        )))]
    } else {
        app.models
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let marker = if *m == app.session.current_model { "● " } else { "  " };
                let style = if app.focus == Focus::Models && i == app.model_idx {
                    Style::default().add_modifier(Modifier::REVERSED)
                } else {
                    Style::default()
                };
                ListItem::new(Line::from(vec![
                    Span::styled(marker, Style::default().fg(Color::Green)),
                    Span::styled(m.clone(), Style::default().fg(Color::White)),
                ]))
                .style(style)
            })
            .collect()
    };

    let list = List::new(items).block(
        Block::default().borders(Borders::ALL).title(Span::styled(
            "Models",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )),
    );
    frame.render_widget(list, area);
}

fn message_lines(message: &Message, markup: &Markup) -> Vec<Line<'static>> {
    let (prefix, prefix_style) = match message.sender {
        Sender::User => ("You:", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Sender::Bot => ("Assistant:", Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD)),
        Sender::System => ("System:", Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
    };
    let mut lines = vec![Line::from(vec![
        Span::styled(prefix, prefix_style),
        Span::styled(format!("  {}", message.timestamp), Style::default().fg(Color::DarkGray)),
    ])];

    match message.sender {
        // Only bot content gets markup; user text is shown exactly as typed.
        Sender::Bot => lines.extend(markup.render(&message.content)),
        _ => lines.extend(
            message
                .content
                .split('\n')
                .map(|l| Line::from(Span::raw(l.to_string()))),
        ),
    }

    if message.response_time.is_some() || message.model.is_some() {
        let mut meta = String::new();
        if let Some(rt) = &message.response_time {
            meta.push_str(&format!("response {rt}"));
        }
        if let Some(m) = &message.model {
            if !meta.is_empty() {
                meta.push_str(" | ");
            }
            meta.push_str(&format!("model {m}"));
        }
        lines.push(Line::from(Span::styled(
            meta,
            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        )));
    }

    lines.push(Line::from(""));
    lines
}

fn typing_frame(tick: u64) -> &'static str {
    match (tick / 3) % 3 {
        0 => "·",
        1 => "· ·",
        _ => "· · ·",
    }
}

fn transcript_text(app: &App) -> Text<'static> {
    let mut text = Text::default();
    for message in &app.transcript.messages {
        for line in message_lines(message, &app.markup) {
            text.push_line(line);
        }
    }
    if app.transcript.typing {
        text.push_line(Line::from(Span::styled(
            "Assistant:",
            Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
        )));
        text.push_line(Line::from(Span::styled(
            typing_frame(app.tick_count).to_string(),
            Style::default().fg(Color::DarkGray),
        )));
        text.push_line(Line::from(""));
    }
    text
}

fn draw_chat(frame: &mut ratatui::Frame, area: Rect, app: &mut App) {
    let v_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(3)])
        .split(area);

    let text = transcript_text(app);
    let inner_height = v_chunks[0].height.saturating_sub(2);
    app.max_scroll = (text.lines.len() as u16).saturating_sub(inner_height);
    if app.follow {
        app.chat_scroll = app.max_scroll;
    }
    let scroll_y = app.chat_scroll.min(app.max_scroll);

    let mode_span = match app.mode {
        Mode::Insert => Span::styled("[INSERT]", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
        Mode::Normal => Span::styled("[NORMAL]", Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
    };
    let (dot_color, status_label) = app.service.indicator();
    let title_spans = vec![
        Span::raw("Chat "),
        mode_span,
        Span::raw(" "),
        Span::styled("●", Style::default().fg(dot_color)),
        Span::raw(" "),
        Span::styled(status_label, Style::default().fg(Color::DarkGray)),
    ];
    let chat_block = Block::default().borders(Borders::ALL).title(Line::from(title_spans));

    let messages = Paragraph::new(text)
        .block(chat_block)
        .wrap(Wrap { trim: false })
        .scroll((scroll_y, 0));
    frame.render_widget(messages, v_chunks[0]);

    let input_title: Line = if app.confirm_clear {
        Line::from(Span::styled(
            "Clear conversation history? (y/n)",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ))
    } else {
        match app.mode {
            Mode::Insert => {
                let count = app.input.chars().count();
                let count_style = if count > CHAR_LIMIT {
                    Style::default().fg(Color::Yellow)
                } else {
                    Style::default().fg(Color::DarkGray)
                };
                let mut spans = vec![
                    Span::raw("Message "),
                    Span::styled("[INSERT] ", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
                    Span::styled(format!("{count}/{CHAR_LIMIT}"), count_style),
                ];
                if app.session.waiting {
                    spans.push(Span::styled("  thinking...", Style::default().fg(Color::Magenta)));
                }
                Line::from(spans)
            }
            Mode::Normal => {
                let base = if app.focus == Focus::Models { "Models " } else { "Navigation " };
                Line::from(vec![
                    Span::raw(base),
                    Span::styled("[NORMAL]", Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
                ])
            }
        }
    };
    let bottom = match app.mode {
        Mode::Insert => app.input.as_str(),
        Mode::Normal => "h=models  l=chat  i=insert  j/k=move  Enter=select  r=refresh  c=clear  ↑/↓=scroll  q=quit",
    };
    let input = Paragraph::new(bottom).block(Block::default().borders(Borders::ALL).title(input_title));
    frame.render_widget(input, v_chunks[1]);

    if app.mode == Mode::Insert && !app.confirm_clear {
        frame.set_cursor(v_chunks[1].x + 1 + app.input.chars().count() as u16, v_chunks[1].y + 1);
    }
}

// ---------- Key handling ----------

fn handle_key(key: KeyEvent, app: &mut App, tx: &UnboundedSender<AppEvent>) {
    if key.kind != KeyEventKind::Press {
        return;
    }
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.quit = true;
        return;
    }

    if app.confirm_clear {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => app.clear_conversation(),
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => app.confirm_clear = false,
            _ => {}
        }
        return;
    }

    match app.mode {
        Mode::Insert => match key.code {
            KeyCode::Esc => app.mode = Mode::Normal,
            KeyCode::Enter => {
                if let Some(out) = app.begin_send() {
                    let api = app.api.clone();
                    let tx2 = tx.clone();
                    tokio::spawn(async move { dispatch_chat(api, out, tx2).await });
                }
            }
            KeyCode::Backspace => {
                app.input.pop();
            }
            KeyCode::Char(c) => app.input.push(c),
            KeyCode::Tab => app.input.push('\t'),
            KeyCode::Up => app.scroll_up(),
            KeyCode::Down => app.scroll_down(),
            _ => {}
        },
        Mode::Normal => match key.code {
            KeyCode::Char('q') => app.quit = true,
            KeyCode::Char('h') => app.focus = Focus::Models,
            KeyCode::Char('l') => app.focus = Focus::Chat,
            KeyCode::Char('i') => {
                if app.focus == Focus::Chat {
                    app.mode = Mode::Insert;
                }
            }
            KeyCode::Char('c') => app.request_clear(),
            KeyCode::Char('r') => {
                tokio::spawn(fetch_health(app.api.clone(), tx.clone()));
                tokio::spawn(fetch_models(app.api.clone(), tx.clone()));
            }
            KeyCode::Char('j') => match app.focus {
                Focus::Models => {
                    if !app.models.is_empty() {
                        app.model_idx = (app.model_idx + 1).min(app.models.len() - 1);
                    }
                }
                Focus::Chat => app.scroll_down(),
            },
            KeyCode::Char('k') => match app.focus {
                Focus::Models => app.model_idx = app.model_idx.saturating_sub(1),
                Focus::Chat => app.scroll_up(),
            },
            KeyCode::Enter => {
                if app.focus == Focus::Models {
                    if let Some(m) = app.models.get(app.model_idx).cloned() {
                        app.switch_model(m);
                    }
                }
            }
            KeyCode::Up => app.scroll_up(),
            KeyCode::Down => app.scroll_down(),
            _ => {}
        },
    }
}

// ---------- Main ----------

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cfg_path = config_path()?;
    let cfg = load_config(&cfg_path).unwrap_or_default();
    let api_url = env::var("TUICHAT_URL")
        .ok()
        .or_else(|| cfg.api_url.clone())
        .unwrap_or_else(|| "http://localhost:5000".to_string());
    let model = env::var("TUICHAT_MODEL")
        .ok()
        .or_else(|| cfg.model.clone())
        .unwrap_or_else(|| "deepseek-r1:7b".to_string());

    let api = ApiClient::new(api_url)?;
    let mut app = App::new(model, api.clone());

    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (tx, mut rx): (UnboundedSender<AppEvent>, UnboundedReceiver<AppEvent>) = unbounded_channel();

    let tx_input = tx.clone();
    std::thread::spawn(move || loop {
        if event::poll(Duration::from_millis(250)).unwrap_or(false) {
            if let Ok(CEvent::Key(key)) = event::read() {
                let _ = tx_input.send(AppEvent::Input(key));
            }
        }
    });

    let tx_tick = tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            let _ = tx_tick.send(AppEvent::Tick);
        }
    });

    tokio::spawn(fetch_health(api.clone(), tx.clone()));
    tokio::spawn(fetch_models(api.clone(), tx.clone()));

    loop {
        terminal.draw(|f| draw_ui(f, &mut app))?;
        if let Some(ev) = rx.recv().await {
            match ev {
                AppEvent::Tick => app.tick_count = app.tick_count.wrapping_add(1),
                AppEvent::Input(key) => handle_key(key, &mut app, &tx),
                AppEvent::ChatDone(outcome) => app.finish_send(outcome),
                AppEvent::Health(status) => app.service = status,
                AppEvent::Models(catalog) => app.apply_catalog(catalog),
            }
        }
        if app.quit {
            break;
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn now_label() -> String {
    format_time(Local::now())
}

fn format_time(t: DateTime<Local>) -> String {
    t.format("%H:%M").to_string()
}

// ---------- Tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_app() -> App {
        App::new("test-model".to_string(), ApiClient::new("http://127.0.0.1:9".to_string()).unwrap())
    }

    fn sample_outcomes() -> Vec<ChatOutcome> {
        vec![
            ChatOutcome::Reply {
                reply: "hi there".to_string(),
                timestamp: "10:00:00".to_string(),
                response_time: Some("1.00s".to_string()),
                model: Some("test-model".to_string()),
            },
            ChatOutcome::Refused {
                error: "model missing".to_string(),
                timestamp: Some("10:00:01".to_string()),
            },
            ChatOutcome::Transport("connection refused".to_string()),
        ]
    }

    #[test]
    fn time_labels_are_zero_padded() {
        use chrono::TimeZone;
        let t = Local.with_ymd_and_hms(2024, 5, 1, 9, 5, 0).unwrap();
        assert_eq!(format_time(t), "09:05");
    }

    #[test]
    fn sent_text_is_trimmed() {
        let mut app = test_app();
        app.input = "  hello  ".to_string();
        let out = app.begin_send().expect("send goes out");
        assert_eq!(out.message, "hello");
        assert_eq!(app.transcript.messages.last().unwrap().content, "hello");
    }

    #[test]
    fn blank_input_send_is_ignored() {
        let mut app = test_app();
        app.input = "   ".to_string();
        assert!(app.begin_send().is_none());
        assert_eq!(app.transcript.messages.len(), 1);
        assert!(!app.transcript.typing);
        assert!(!app.session.waiting);
    }

    #[test]
    fn send_while_waiting_is_ignored() {
        let mut app = test_app();
        app.input = "hello".to_string();
        let out = app.begin_send().expect("first send goes out");
        assert_eq!(out.message, "hello");
        assert_eq!(out.model, "test-model");
        assert_eq!(app.transcript.messages.len(), 2);
        assert!(app.input.is_empty());
        assert!(app.session.waiting);
        assert!(app.transcript.typing);

        app.input = "again".to_string();
        assert!(app.begin_send().is_none());
        assert_eq!(app.transcript.messages.len(), 2);
    }

    #[test]
    fn placeholder_never_survives_a_completed_exchange() {
        for outcome in sample_outcomes() {
            let mut app = test_app();
            app.input = "hello".to_string();
            app.begin_send().expect("send goes out");
            app.finish_send(outcome);
            assert!(!app.transcript.typing);
            assert!(!app.session.waiting);
            assert_eq!(app.transcript.messages.len(), 3);
            assert_ne!(app.transcript.messages.last().unwrap().sender, Sender::User);
        }
    }

    #[test]
    fn metadata_only_present_on_successful_replies() {
        let mut app = test_app();
        app.input = "hello".to_string();
        app.begin_send().unwrap();
        app.finish_send(sample_outcomes().remove(0));
        let reply = app.transcript.messages.last().unwrap();
        assert_eq!(reply.response_time.as_deref(), Some("1.00s"));
        assert_eq!(reply.model.as_deref(), Some("test-model"));
        assert_eq!(reply.timestamp, "10:00:00");

        for outcome in sample_outcomes().into_iter().skip(1) {
            let mut app = test_app();
            app.input = "hello".to_string();
            app.begin_send().unwrap();
            app.finish_send(outcome);
            let msg = app.transcript.messages.last().unwrap();
            assert!(msg.response_time.is_none());
            assert!(msg.model.is_none());
        }
    }

    #[test]
    fn error_outcomes_are_labelled() {
        let mut app = test_app();
        app.input = "hello".to_string();
        app.begin_send().unwrap();
        app.finish_send(ChatOutcome::Refused { error: "boom".to_string(), timestamp: None });
        assert_eq!(app.transcript.messages.last().unwrap().content, "Error: boom");

        app.input = "hello".to_string();
        app.begin_send().unwrap();
        app.finish_send(ChatOutcome::Transport("refused".to_string()));
        assert_eq!(app.transcript.messages.last().unwrap().content, "Network error: refused");
    }

    #[test]
    fn markup_applies_fixed_pass_order() {
        let markup = Markup::new();
        let lines = markup.render("**a** *b* `c`\nd");
        assert_eq!(lines.len(), 2);
        let styled: Vec<(&str, Style)> =
            lines[0].spans.iter().map(|s| (s.content.as_ref(), s.style)).collect();
        assert!(styled.contains(&("a", Style::default().add_modifier(Modifier::BOLD))));
        assert!(styled.contains(&("b", Style::default().add_modifier(Modifier::ITALIC))));
        assert!(styled.contains(&("c", Style::default().fg(Color::Cyan))));
        assert_eq!(lines[1].spans[0].content.as_ref(), "d");
    }

    #[test]
    fn code_spans_are_not_protected_from_earlier_passes() {
        // The strong pass runs before the code pass, so the delimiters inside
        // the backticks are consumed first and the backticks stay literal.
        // Known quirk of the fixed pass order, not a feature.
        let markup = Markup::new();
        let lines = markup.render("`**x**`");
        let styled: Vec<(&str, Style)> =
            lines[0].spans.iter().map(|s| (s.content.as_ref(), s.style)).collect();
        assert_eq!(
            styled,
            vec![
                ("`", Style::default()),
                ("x", Style::default().add_modifier(Modifier::BOLD)),
                ("`", Style::default()),
            ]
        );
    }

    #[test]
    fn user_content_is_rendered_literally() {
        let markup = Markup::new();
        let message = Message::user("**a**".to_string(), "10:00".to_string());
        let lines = message_lines(&message, &markup);
        assert_eq!(lines[1].spans[0].content.as_ref(), "**a**");
        assert_eq!(lines[1].spans[0].style, Style::default());
    }

    #[test]
    fn catalog_selects_server_reported_model() {
        let mut app = test_app();
        app.apply_catalog(ModelCatalog {
            models: vec!["m1".to_string(), "m2".to_string()],
            current_model: "m2".to_string(),
        });
        assert_eq!(app.models, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(app.model_idx, 1);
        assert_eq!(app.session.current_model, "m2");
    }

    #[test]
    fn switch_model_announces_once() {
        let mut app = test_app();
        app.switch_model("m2".to_string());
        assert_eq!(app.session.current_model, "m2");
        let last = app.transcript.messages.last().unwrap();
        assert_eq!(last.sender, Sender::System);
        assert!(last.content.contains("m2"));
        let len = app.transcript.messages.len();

        app.switch_model("m2".to_string());
        assert_eq!(app.transcript.messages.len(), len);
    }

    #[test]
    fn clear_keeps_welcome_and_requires_confirmation() {
        let mut app = test_app();
        app.append(Message::user("one".to_string(), "10:00".to_string()));
        app.append(Message::bot("two".to_string(), "10:01".to_string()));

        app.request_clear();
        assert!(app.confirm_clear);
        assert_eq!(app.transcript.messages.len(), 3);

        // declining leaves the transcript untouched
        app.confirm_clear = false;
        assert_eq!(app.transcript.messages.len(), 3);

        app.request_clear();
        app.clear_conversation();
        assert!(!app.confirm_clear);
        assert_eq!(app.transcript.messages.len(), 2);
        assert_eq!(app.transcript.messages[0].content, WELCOME_TEXT);
        assert_eq!(app.transcript.messages[0].sender, Sender::Bot);
        let cleared = &app.transcript.messages[1];
        assert_eq!(cleared.sender, Sender::System);
        assert!(cleared.content.contains("cleared"));
        assert_eq!(app.session.current_model, "test-model");
    }

    #[test]
    fn clear_interlock_swallows_other_keys() {
        let mut app = test_app();
        let (tx, _rx) = unbounded_channel();
        handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE), &mut app, &tx);
        assert!(app.confirm_clear);

        // while armed, anything but y/n/Esc is ignored
        handle_key(KeyEvent::new(KeyCode::Char('x'), KeyModifiers::NONE), &mut app, &tx);
        assert!(app.confirm_clear);
        assert_eq!(app.transcript.messages.len(), 1);

        handle_key(KeyEvent::new(KeyCode::Char('n'), KeyModifiers::NONE), &mut app, &tx);
        assert!(!app.confirm_clear);
        assert_eq!(app.transcript.messages.len(), 1);

        handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE), &mut app, &tx);
        handle_key(KeyEvent::new(KeyCode::Char('y'), KeyModifiers::NONE), &mut app, &tx);
        assert!(!app.confirm_clear);
        let last = app.transcript.messages.last().unwrap();
        assert_eq!(last.sender, Sender::System);
    }

    #[test]
    fn health_status_mapping() {
        assert_eq!(ServiceStatus::from_status(Some("healthy")), ServiceStatus::Healthy);
        assert_eq!(ServiceStatus::from_status(Some("unhealthy")), ServiceStatus::Unhealthy);
        assert_eq!(ServiceStatus::from_status(Some("banana")), ServiceStatus::Unreachable);
        assert_eq!(ServiceStatus::from_status(None), ServiceStatus::Unreachable);
    }

    #[tokio::test]
    async fn chat_success_parses_reply_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "reply": "hello there",
                "timestamp": "10:00:00",
                "response_time": "0.42s",
                "model": "m1"
            })))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri()).unwrap();
        let resp = api.chat("hi", "m1").await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.reply.as_deref(), Some("hello there"));
        assert_eq!(resp.response_time.as_deref(), Some("0.42s"));
        assert_eq!(resp.model.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn refused_and_malformed_bodies_become_distinct_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "error": "model not found",
                "timestamp": "10:00:01"
            })))
            .mount(&server)
            .await;
        let api = ApiClient::new(server.uri()).unwrap();
        let (tx, mut rx) = unbounded_channel();
        dispatch_chat(api, OutboundChat { message: "hi".to_string(), model: "m1".to_string() }, tx).await;
        match rx.recv().await {
            Some(AppEvent::ChatDone(ChatOutcome::Refused { error, timestamp })) => {
                assert_eq!(error, "model not found");
                assert_eq!(timestamp.as_deref(), Some("10:00:01"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let server2 = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server2)
            .await;
        let api2 = ApiClient::new(server2.uri()).unwrap();
        let (tx2, mut rx2) = unbounded_channel();
        dispatch_chat(api2, OutboundChat { message: "hi".to_string(), model: "m1".to_string() }, tx2).await;
        assert!(matches!(rx2.recv().await, Some(AppEvent::ChatDone(ChatOutcome::Transport(_)))));
    }

    #[tokio::test]
    async fn health_and_models_endpoints_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "healthy"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": ["m1", "m2"],
                "current_model": "m2"
            })))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri()).unwrap();
        let health = api.health().await.unwrap();
        assert_eq!(ServiceStatus::from_status(health.status.as_deref()), ServiceStatus::Healthy);
        let catalog = api.models().await.unwrap();
        assert_eq!(catalog.models, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(catalog.current_model, "m2");
    }

    #[tokio::test]
    async fn unreachable_service_maps_to_unreachable_status() {
        let api = ApiClient::new("http://127.0.0.1:9".to_string()).unwrap();
        let (tx, mut rx) = unbounded_channel();
        fetch_health(api, tx).await;
        assert!(matches!(rx.recv().await, Some(AppEvent::Health(ServiceStatus::Unreachable))));
    }

    #[tokio::test]
    async fn model_fetch_failure_sends_no_update() {
        let api = ApiClient::new("http://127.0.0.1:9".to_string()).unwrap();
        let (tx, mut rx) = unbounded_channel();
        fetch_models(api, tx).await;
        assert!(rx.try_recv().is_err());
    }
}
