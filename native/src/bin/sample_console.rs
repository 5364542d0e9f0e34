// Minimal console child speaking the bridge protocol.
//
// Commands: echo <text>, progress <steps>, choice <millis>, title <text>, exit.

use console_bridge::logging::init_logger;
use console_bridge::protocol::{
    ChoicePrompt, ProgressEvent, ProgressOperation, ProgressSide,
};
use console_bridge::{
    instance_from_args, ChannelPrefixes, ConsoleClient, ConsoleEvent, EventReply, Result,
    SessionConfig,
};
use log::debug;
use std::process::ExitCode;
use std::time::Duration;

const PROMPT: &str = "sample> ";

struct SampleConsole {
    client: ConsoleClient,
    wants_progress: bool,
}

impl SampleConsole {
    fn print(&self, message: &str) -> Result<()> {
        self.client.send(&ConsoleEvent::Print {
            message: message.to_string(),
            from_beginning: false,
        })?;
        Ok(())
    }

    fn redraw(&self, message: &str) -> Result<()> {
        self.client.send(&ConsoleEvent::Print {
            message: message.to_string(),
            from_beginning: true,
        })?;
        Ok(())
    }

    fn read_command(&self) -> Result<Option<String>> {
        self.print(PROMPT)?;
        match self.client.send(&ConsoleEvent::Input {
            prompt: PROMPT.to_string(),
            echo: true,
        })? {
            EventReply::Input {
                accepted: true,
                answer,
            } => Ok(Some(answer)),
            _ => Ok(None),
        }
    }

    fn progress(&self, steps: u32) -> Result<()> {
        let steps = steps.max(1);
        for step in 0..=steps {
            let percent = step * 100 / steps;
            if self.wants_progress {
                self.client.send(&ConsoleEvent::Progress(ProgressEvent {
                    operation: ProgressOperation::Transfer,
                    side: ProgressSide::Local,
                    file_name: "sample.bin".to_string(),
                    directory: "/".to_string(),
                    overall_percent: percent,
                    file_percent: percent,
                    bytes_per_second: 1024,
                }))?;
            }
            self.redraw(&format!("sample.bin {:>3}%", percent))?;
        }
        self.print("\n")
    }

    fn choice(&self, millis: u64) -> Result<()> {
        let reply = self.client.send(&ConsoleEvent::Choice(ChoicePrompt {
            timeouting: millis > 0,
            timeout: Duration::from_millis(millis),
            break_value: -1,
            timeouted_value: 1,
        }))?;
        match reply {
            EventReply::Choice { result } => self.print(&format!("choice result {}\n", result)),
            other => self.print(&format!("unexpected reply {:?}\n", other)),
        }
    }

    fn run(&mut self) -> Result<u8> {
        if let EventReply::Init { wants_progress, .. } = self.client.send(&ConsoleEvent::Init)? {
            self.wants_progress = wants_progress;
        }
        self.print("Sample console ready\n")?;

        loop {
            if self.client.cancel_requested()? {
                return Ok(2);
            }
            let command = match self.read_command()? {
                Some(command) => command,
                None => return Ok(3),
            };
            debug!("[SAMPLE] Command [{}]", command);

            let (verb, rest) = command
                .split_once(' ')
                .unwrap_or((command.as_str(), ""));
            match verb {
                "echo" => self.print(&format!("{}\n", rest))?,
                "progress" => self.progress(rest.trim().parse().unwrap_or(4))?,
                "choice" => self.choice(rest.trim().parse().unwrap_or(0))?,
                "title" => {
                    self.client.send(&ConsoleEvent::Title {
                        title: rest.to_string(),
                    })?;
                }
                "exit" => {
                    self.print("Bye\n")?;
                    return Ok(0);
                }
                "" => {}
                other => self.print(&format!("Unknown command: {}\n", other))?,
            }
        }
    }
}

fn main() -> ExitCode {
    init_logger();

    let config = SessionConfig::default();
    let instance = match instance_from_args(std::env::args(), &config.instance_switch) {
        Some(instance) => instance,
        None => {
            eprintln!(
                "sample-console: missing {}=<instance>",
                config.instance_switch
            );
            return ExitCode::FAILURE;
        }
    };

    let client = match ConsoleClient::attach(&instance, &ChannelPrefixes::default()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("sample-console: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut console = SampleConsole {
        client,
        wants_progress: false,
    };
    match console.run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("sample-console: {}", e);
            ExitCode::FAILURE
        }
    }
}
