use chrono::Local;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::style::Stylize;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{self, IsTerminal, Write};
use std::time::Duration;

pub fn heading(text: &str) {
    println!("\n{}", text.bold());
}

pub fn step(text: &str) {
    println!("{} {text}", format!("[{}]", timestamp()).dark_grey());
}

pub fn success(text: &str) {
    println!("{} {text}", "✔".green());
}

pub fn failure(text: &str) {
    eprintln!("{} {text}", "✖".red());
}

pub fn next_steps(commands: &[String]) {
    if commands.is_empty() {
        return;
    }
    eprintln!("{}", "Next steps:".bold());
    for c in commands {
        eprintln!("  $ {c}");
    }
}

pub fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

pub fn stdin_is_interactive() -> bool {
    io::stdin().is_terminal()
}

/// Single-key y/N prompt. Anything but y/Y (or a prompt timeout) is "no".
pub fn confirm(question: &str, wait: Duration) -> bool {
    print!("{question} [y/N] ");
    let _ = io::stdout().flush();

    if enable_raw_mode().is_err() {
        println!();
        return false;
    }
    let answer = read_yes_no(wait);
    let _ = disable_raw_mode();
    println!("{}", if answer { "y" } else { "n" });
    answer
}

fn read_yes_no(wait: Duration) -> bool {
    loop {
        match event::poll(wait) {
            Ok(true) => {}
            _ => return false,
        }
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                return matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y'));
            }
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}
