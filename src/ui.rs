use crossterm::cursor::Show;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Style};
use ratatui::widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table, Wrap};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

enum UiEvent {
    Log(String),
    Finish(String),
}

#[derive(Clone)]
struct TaskState {
    status: String,
    detail: String,
    seq: u64,
}

struct UiState {
    title: String,
    started: Instant,
    last_phase: String,
    last_status_line: String,
    scatter_line: String,
    stats_line: String,
    logs: VecDeque<String>,
    tasks: BTreeMap<String, TaskState>,
    seq: u64,
    summary: Option<String>,
}

impl UiState {
    fn new(title: String) -> Self {
        Self {
            title,
            started: Instant::now(),
            last_phase: "starting".to_string(),
            last_status_line: "status=starting".to_string(),
            scatter_line: String::new(),
            stats_line: String::new(),
            logs: VecDeque::new(),
            tasks: BTreeMap::new(),
            seq: 0,
            summary: None,
        }
    }

    fn ingest_log(&mut self, line: String) {
        let cleaned = line.strip_prefix("progress ").unwrap_or(line.as_str()).to_string();
        self.logs.push_back(cleaned.clone());
        while self.logs.len() > 16 {
            let _ = self.logs.pop_front();
        }
        if !cleaned.is_empty() {
            self.last_status_line = cleaned.clone();
        }

        let kv = parse_progress_kv(&cleaned);
        if let Some(phase) = kv.get("phase") {
            self.last_phase = phase.clone();
        }
        match kv.get("phase").map(|v| v.as_str()) {
            Some("scatter") => {
                let status = kv.get("status").cloned().unwrap_or_default();
                let running = kv.get("running").cloned().unwrap_or_default();
                let total = kv.get("total").cloned().unwrap_or_default();
                self.scatter_line =
                    format!("scatter status={status} running={running} total={total}");
            }
            Some("stats") => {
                let cpu = kv.get("cpu").cloned().unwrap_or_default();
                let mem = kv.get("mem").cloned().unwrap_or_default();
                let load = kv.get("load").cloned().unwrap_or_default();
                self.stats_line = format!("CPU {cpu}%  RAM {mem}  load {load}");
            }
            Some("task") => {
                if let Some(task) = kv.get("task") {
                    self.seq += 1;
                    let status = kv.get("status").cloned().unwrap_or_default();
                    let detail = kv.get("detail").cloned().unwrap_or_default();
                    self.tasks
                        .insert(task.clone(), TaskState { status, detail, seq: self.seq });
                }
            }
            _ => {}
        }
    }
}

fn parse_progress_kv(line: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for token in line.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            out.insert(key.to_string(), value.to_string());
        }
    }
    out
}

/// Full-screen progress pane. Consumes progress lines via its sink, renders
/// the run phase, the task table, a resource line, and a log tail.
pub struct ProgressUi {
    tx: Sender<UiEvent>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressUi {
    pub fn start(title: String) -> ProgressUi {
        let (tx, rx) = mpsc::channel::<UiEvent>();
        let handle = thread::spawn(move || run_ui(title, rx));
        ProgressUi { tx, handle: Some(handle) }
    }

    /// A sink suitable for progress::install_progress_sink.
    pub fn sink(&self) -> Arc<dyn Fn(String) + Send + Sync + 'static> {
        let tx = self.tx.clone();
        Arc::new(move |line| {
            let _ = tx.send(UiEvent::Log(line));
        })
    }

    pub fn finish(mut self, summary: String) {
        let _ = self.tx.send(UiEvent::Finish(summary));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressUi {
    fn drop(&mut self) {
        let _ = self.tx.send(UiEvent::Finish(String::new()));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_ui(title: String, rx: Receiver<UiEvent>) {
    let mut state = UiState::new(title);
    if enable_raw_mode().is_err() {
        return;
    }
    let mut stdout = std::io::stdout();
    let _ = execute!(stdout, EnterAlternateScreen);
    let backend = CrosstermBackend::new(stdout);
    let Ok(mut terminal) = Terminal::new(backend) else {
        let _ = disable_raw_mode();
        return;
    };

    loop {
        let mut done = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                UiEvent::Log(line) => state.ingest_log(line),
                UiEvent::Finish(summary) => {
                    if !summary.is_empty() {
                        state.summary = Some(summary);
                    }
                    done = true;
                }
            }
        }

        let _ = terminal.draw(|frame| draw(frame, &state));

        if done {
            break;
        }
        // ctrl-c inside the pane requests cancellation
        if event::poll(Duration::from_millis(100)).unwrap_or(false) {
            if let Ok(Event::Key(key)) = event::read() {
                if key.kind == KeyEventKind::Press
                    && key.code == KeyCode::Char('c')
                    && key.modifiers.contains(KeyModifiers::CONTROL)
                {
                    crate::progress::request_cancellation("ctrl-c in progress pane");
                }
            }
        }
    }

    let _ = disable_raw_mode();
    let _ = execute!(terminal.backend_mut(), LeaveAlternateScreen, Show);
    if let Some(summary) = &state.summary {
        println!("{summary}");
    }
}

fn draw(frame: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(5),
            Constraint::Min(6),
            Constraint::Length(10),
        ])
        .split(frame.area());

    let elapsed = state.started.elapsed().as_secs();
    let header = Paragraph::new(format!(
        "{}  [{}:{:02}:{:02}]",
        state.title,
        elapsed / 3600,
        (elapsed / 60) % 60,
        elapsed % 60
    ))
    .block(Block::default().borders(Borders::ALL).title("stimela"));
    frame.render_widget(header, chunks[0]);

    let mut status_lines =
        vec![format!("phase: {}", state.last_phase), state.stats_line.clone()];
    if !state.scatter_line.is_empty() {
        status_lines.push(state.scatter_line.clone());
    }
    status_lines.push(state.last_status_line.clone());
    let status = Paragraph::new(status_lines.join("\n"))
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("status"));
    frame.render_widget(status, chunks[1]);

    let mut tasks: Vec<(&String, &TaskState)> = state.tasks.iter().collect();
    tasks.sort_by_key(|(_, task)| std::cmp::Reverse(task.seq));
    let rows: Vec<Row> = tasks
        .iter()
        .take(12)
        .map(|(name, task)| {
            let style = match task.status.as_str() {
                "started" => Style::default().fg(Color::Yellow),
                "update" => Style::default().fg(Color::Cyan),
                _ => Style::default(),
            };
            Row::new(vec![
                Cell::from((*name).clone()),
                Cell::from(task.status.clone()).style(style),
                Cell::from(task.detail.clone()),
            ])
        })
        .collect();
    let table = Table::new(
        rows,
        [Constraint::Percentage(50), Constraint::Length(12), Constraint::Percentage(38)],
    )
    .header(Row::new(vec!["task", "status", "detail"]).style(Style::default().fg(Color::Green)))
    .block(Block::default().borders(Borders::ALL).title("tasks"));
    frame.render_widget(table, chunks[2]);

    let items: Vec<ListItem> = state.logs.iter().map(|line| ListItem::new(line.clone())).collect();
    let log_list =
        List::new(items).block(Block::default().borders(Borders::ALL).title("progress log"));
    frame.render_widget(log_list, chunks[3]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_kv_parsing() {
        let kv = parse_progress_kv("phase=task status=started task=recipe.step1");
        assert_eq!(kv["phase"], "task");
        assert_eq!(kv["task"], "recipe.step1");
    }

    #[test]
    fn state_tracks_tasks_and_phases() {
        let mut state = UiState::new("test".to_string());
        state.ingest_log("phase=task status=started task=r.s1".to_string());
        state.ingest_log("phase=scatter status=dispatch running=2 total=3".to_string());
        state.ingest_log("phase=stats cpu=50.0 mem=1.0/8G load=0.5 task=r.s1".to_string());
        assert_eq!(state.tasks["r.s1"].status, "started");
        assert!(state.scatter_line.contains("running=2"));
        assert!(state.stats_line.contains("50.0"));
        assert_eq!(state.last_phase, "stats");
    }

    #[test]
    fn log_tail_is_bounded() {
        let mut state = UiState::new("test".to_string());
        for i in 0..40 {
            state.ingest_log(format!("phase=log line={i}"));
        }
        assert_eq!(state.logs.len(), 16);
    }
}
