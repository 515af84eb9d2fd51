//! # Monitor Console
//!
//! Full-screen dashboard over a shared [`CpuContext`]: registers, flags
//! and interrupt state, the three pipeline stages, memory and the terminal
//! screen, plus a command bar that accepts anything the shell accepts.
//!
//! ## Keys
//! - `q` quit, `s` step one tick, `r` run/stop, `h` help
//! - `:` opens the command bar, `Enter` executes, `Esc` cancels

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::asm;
use crate::components::pipeline::StageRecord;
use crate::isa::Reg;
use crate::systems::cpu_context::CpuContext;
use crate::systems::runner::lock;
use crate::types::Nibble;

/// Console configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub refresh_rate_ms: u64,
    pub show_memory: bool,
    pub show_pipeline: bool,
    pub show_screen: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            refresh_rate_ms: 100,
            show_memory: true,
            show_pipeline: true,
            show_screen: true,
        }
    }
}

/// Console UI application state
pub struct ConsoleApp {
    context: Arc<Mutex<CpuContext>>,
    config: ConsoleConfig,
    running: bool,
    editing: bool,
    command_buffer: String,
    output: Vec<String>,
    show_help: bool,
}

impl ConsoleApp {
    pub fn new(context: Arc<Mutex<CpuContext>>, config: ConsoleConfig) -> Self {
        Self {
            context,
            config,
            running: false,
            editing: false,
            command_buffer: String::new(),
            output: Vec::new(),
            show_help: false,
        }
    }

    pub fn run(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;
        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> io::Result<()> {
        let refresh = Duration::from_millis(self.config.refresh_rate_ms.max(10));
        let mut last_draw: Option<Instant> = None;
        self.running = true;

        while self.running {
            if event::poll(Duration::from_millis(10))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind != KeyEventKind::Release {
                        self.handle_key_event(key.code);
                    }
                }
            }
            if last_draw.map_or(true, |at| at.elapsed() >= refresh) {
                terminal.draw(|f| self.draw_ui(f))?;
                last_draw = Some(Instant::now());
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Recent command output, oldest first.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn handle_key_event(&mut self, key: KeyCode) {
        if self.show_help {
            self.show_help = false;
            return;
        }
        if self.editing {
            match key {
                KeyCode::Esc => {
                    self.editing = false;
                    self.command_buffer.clear();
                }
                KeyCode::Enter => {
                    self.editing = false;
                    let command = std::mem::take(&mut self.command_buffer);
                    self.execute_command(&command);
                }
                KeyCode::Backspace => {
                    self.command_buffer.pop();
                }
                KeyCode::Char(c) => self.command_buffer.push(c),
                _ => {}
            }
            return;
        }

        match key {
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                self.running = false;
                lock(&self.context).stop();
            }
            KeyCode::Char('h') | KeyCode::Char('H') => self.show_help = true,
            KeyCode::Char('s') | KeyCode::Char('S') => self.execute_command("step"),
            KeyCode::Char('r') | KeyCode::Char('R') => {
                let running = lock(&self.context).is_running();
                self.execute_command(if running { "stop" } else { "run" });
            }
            KeyCode::Char(':') => self.editing = true,
            other => debug!(key = ?other, "unbound key"),
        }
    }

    fn execute_command(&mut self, command: &str) {
        let command = command.trim();
        if command.is_empty() {
            return;
        }
        if matches!(command, "exit" | "quit") {
            self.running = false;
            return;
        }
        let result = lock(&self.context).execute_line(command);
        self.push_output(format!("> {command}"));
        match result {
            Ok(Some(text)) => text.lines().for_each(|line| self.push_output(line.to_string())),
            Ok(None) => {}
            Err(e) => self.push_output(format!("error: {e}")),
        }
    }

    fn push_output(&mut self, line: String) {
        const KEEP: usize = 200;
        self.output.push(line);
        if self.output.len() > KEEP {
            self.output.drain(..self.output.len() - KEEP);
        }
    }

    fn draw_ui(&self, f: &mut Frame) {
        if self.show_help {
            self.draw_help_screen(f);
            return;
        }

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(10), Constraint::Length(8), Constraint::Length(3)])
            .split(f.size());

        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
            .split(chunks[0]);

        let cpu = lock(&self.context);
        self.draw_machine(f, columns[0], &cpu);
        if self.config.show_screen {
            draw_screen(f, columns[1], &cpu);
        }
        drop(cpu);

        let visible = usize::from(chunks[1].height.saturating_sub(2));
        let start = self.output.len().saturating_sub(visible);
        let output: Vec<Line> = self.output[start..].iter().map(|l| Line::from(l.as_str())).collect();
        f.render_widget(
            Paragraph::new(output).block(Block::default().borders(Borders::ALL).title("Output")),
            chunks[1],
        );

        let (text, style) = if self.editing {
            (format!(":{}", self.command_buffer), Style::default().fg(Color::White))
        } else {
            (
                "q quit  s step  r run/stop  h help  : command".to_string(),
                Style::default().fg(Color::DarkGray),
            )
        };
        f.render_widget(
            Paragraph::new(text)
                .style(style)
                .block(Block::default().borders(Borders::ALL).title("Command")),
            chunks[2],
        );
    }

    fn draw_machine(&self, f: &mut Frame, area: Rect, cpu: &CpuContext) {
        let bold = Style::default().add_modifier(Modifier::BOLD);
        let flags = cpu.flags();
        let irq = cpu.interrupts();
        let state = cpu.run_status();

        let mut lines = vec![
            Line::from(vec![
                Span::styled("PC ", bold),
                Span::raw(cpu.pc().to_string()),
                Span::raw(format!("  Z={} C={}  ", u8::from(flags.zero), u8::from(flags.carry))),
                Span::styled(state, Style::default().fg(Color::Yellow)),
                Span::raw(format!("  {:?}", cpu.mode())),
            ]),
            Line::from(
                Reg::ALL
                    .iter()
                    .map(|&reg| Span::raw(format!("{reg}={} ", cpu.register(reg))))
                    .collect::<Vec<_>>(),
            ),
            Line::from(format!(
                "IRQ enabled={} in_handler={} saved PC={}",
                irq.enabled, irq.in_handler, irq.saved_pc
            )),
        ];

        if self.config.show_pipeline {
            let pipeline = cpu.pipeline();
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled("Pipeline", bold)));
            let fetch = pipeline
                .fetch_stage()
                .map_or("-".to_string(), |slot| format!("@{}", slot.pc));
            lines.push(Line::from(format!("  fetch   {fetch}")));
            lines.push(Line::from(format!("  decode  {}", stage_text(pipeline.decode_stage()))));
            lines.push(Line::from(format!("  execute {}", stage_text(pipeline.execute_stage()))));
        }

        if self.config.show_memory {
            let memory = cpu.datapath().bus().snapshot();
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled("Memory", bold)));
            for (index, words) in memory.chunks(4).enumerate() {
                let words: Vec<String> = words.iter().map(Nibble::to_string).collect();
                lines.push(Line::from(format!("  {:>2}: {}", index * 4, words.join(" "))));
            }
        }

        f.render_widget(
            Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(cpu.config().name.as_str())),
            area,
        );
    }

    fn draw_help_screen(&self, f: &mut Frame) {
        let mut lines = vec![
            Line::from(Span::styled(
                "emu4 monitor",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
            Line::from("q quit, s step, r run/stop, h help, : command bar"),
            Line::from(""),
        ];
        lines.extend(asm::help_text().lines().map(|l| Line::from(l.to_string())));
        lines.push(Line::from(""));
        lines.push(Line::from("Press any key to return"));
        f.render_widget(
            Paragraph::new(lines)
                .wrap(Wrap { trim: false })
                .block(Block::default().borders(Borders::ALL).title("Help")),
            f.size(),
        );
    }
}

fn draw_screen(f: &mut Frame, area: Rect, cpu: &CpuContext) {
    let terminal = cpu.datapath().bus().terminal();
    let lines: Vec<Line> = terminal.screen_lines().into_iter().map(Line::from).collect();
    let title = format!("Terminal (echo {})", if terminal.echo() { "on" } else { "off" });
    f.render_widget(Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)), area);
}

fn stage_text(record: &StageRecord) -> String {
    if record.valid {
        format!("{} @{}", asm::format_instruction(&record.instruction), record.pc)
    } else {
        "-".to_string()
    }
}

/// Opens the monitor and blocks until the user quits.
pub fn run_console(context: Arc<Mutex<CpuContext>>, config: ConsoleConfig) -> io::Result<()> {
    ConsoleApp::new(context, config).run()
}
