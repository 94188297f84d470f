use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use voice_call_rs::audio::AlsaAudio;
use voice_call_rs::{CallController, CallSnapshot, CallStatus, Config, Initiator, WsConnector};

const HELP: &str = "commands: c = call, m = mute/unmute, e = end call, q = quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();
    log::info!("{} {} starting", env!("APP_NAME"), env!("APP_VERSION"));

    // 加载配置
    let config = Config::new().unwrap_or_default();
    let url = config.voice_url()?;
    log::info!("Voice endpoint: {}", url);

    let token = (!config.ws_token.is_empty()).then(|| config.ws_token.clone());
    let connector = Arc::new(WsConnector::new(token, config.connect_timeout()));
    let audio = Arc::new(AlsaAudio::new(&config));

    let controller = Arc::new(CallController::new(
        config,
        audio.clone(),
        audio,
        connector,
    ));
    let mut state = controller.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut last = controller.snapshot();

    println!("Voice call client ready. {}", HELP);

    // 主事件循环：终端命令 + 状态变化
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "c" => {
                        // 建立通话期间仍需响应 e / Ctrl+C，放到独立任务里
                        let controller = controller.clone();
                        tokio::spawn(async move {
                            if let Err(e) = controller.start_call().await {
                                println!("{}", e);
                            }
                        });
                    }
                    "m" => match controller.toggle_mute() {
                        Ok(muted) => println!("{}", if muted { "Muted" } else { "Unmuted" }),
                        Err(e) => println!("{}", e),
                    },
                    "e" => controller.end_call(Initiator::User),
                    "q" => break,
                    "" => {}
                    _ => println!("{}", HELP),
                }
            }

            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                report(&last, &snapshot);
                last = snapshot;
            }
        }
    }

    controller.end_call(Initiator::User);
    // let the socket task deliver end-call before the runtime goes away
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

fn report(before: &CallSnapshot, now: &CallSnapshot) {
    if before.status != now.status {
        match now.status {
            CallStatus::Failed(reason) => println!("Call failed: {}", reason),
            status => println!("Call status: {:?}", status),
        }
    }
    if before.speaking != now.speaking {
        println!("{}", if now.speaking { "[agent speaking]" } else { "[agent quiet]" });
    }
    if before.listening != now.listening && now.listening {
        println!("[listening]");
    }
    if now.transcript.len() > before.transcript.len() {
        for entry in &now.transcript[before.transcript.len()..] {
            println!("{:?}: {}", entry.role, entry.text);
        }
    }
}
