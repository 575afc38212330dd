//! Link-Chat CLI - raw Ethernet 채팅/파일 전송
//!
//! 사용법:
//!   sudo cargo run --release --bin linkchat -- [OPTIONS] [COMMAND]
//!
//! 예시:
//!   # 수신 대기 (메시지, 파일, peer 변화 출력)
//!   sudo cargo run --release --bin linkchat -- -i eth0 listen
//!
//!   # 메시지 전송
//!   sudo cargo run --release --bin linkchat -- -i eth0 send --to aa:bb:cc:dd:ee:ff --text "hola"
//!
//!   # 폴더 전송
//!   sudo cargo run --release --bin linkchat -- -i eth0 send --to aa:bb:cc:dd:ee:ff --path ./docs

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use linkchat::{Config, MacAddr, Node, NodeEvents};

/// 실행 모드
enum Command {
    Listen,
    Send,
    Peers,
}

/// CLI 설정
struct CliConfig {
    command: Command,
    to: Option<String>,
    text: Option<String>,
    path: Option<PathBuf>,
    config: Config,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            command: Command::Listen,
            to: None,
            text: None,
            path: None,
            config: Config::default(),
        }
    }
}

const HELP: &str = r#"Link-Chat - raw Ethernet 메시징/파일 전송

IP 없이 EtherType 0x88B5(채팅/파일), 0x88B6(탐색) 프레임으로 통신
- 같은 브로드캐스트 도메인의 peer 자동 탐색
- RSA-OAEP + AES-256-CBC 메시지 암호화 (공개키 자동 교환)
- 청크 파일 전송, 폴더는 아카이브로 묶어 전송
raw 소켓이 필요하므로 root 또는 CAP_NET_RAW 권한으로 실행

사용법:
  linkchat [OPTIONS] [listen | send | peers]

명령:
  listen                 수신 대기 (기본)
  send                   --to 대상으로 --text 메시지 또는 --path 파일/폴더 전송
  peers                  탐색된 peer 목록 출력

옵션:
  -i, --interface <IF>   네트워크 인터페이스 (기본: $LINKCHAT_IFACE 또는 wlp0s20f3)
  -t, --to <MAC>         대상 MAC (ff:ff:ff:ff:ff:ff = 브로드캐스트)
  -m, --text <TEXT>      전송할 메시지
  -p, --path <PATH>      전송할 파일 또는 폴더
  -d, --download <DIR>   수신 파일 저장 디렉터리 (기본: downloads)
  --preset <NAME>        설정 프리셋 (fast-lan | congested)
  --no-encrypt           암호화 비활성화
  -h, --help             이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#;

fn parse_args() -> Result<CliConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliConfig::default();

    let value = |i: usize| -> Result<String, String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| format!("{} 옵션에 값이 필요함", args[i]))
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "listen" => cli.command = Command::Listen,
            "send" => cli.command = Command::Send,
            "peers" => cli.command = Command::Peers,
            "--interface" | "-i" => {
                cli.config.interface = value(i)?;
                i += 1;
            }
            "--to" | "-t" => {
                cli.to = Some(value(i)?);
                i += 1;
            }
            "--text" | "-m" => {
                cli.text = Some(value(i)?);
                i += 1;
            }
            "--path" | "-p" => {
                cli.path = Some(PathBuf::from(value(i)?));
                i += 1;
            }
            "--download" | "-d" => {
                cli.config.download_dir = PathBuf::from(value(i)?);
                i += 1;
            }
            "--preset" => {
                let preset = match value(i)?.as_str() {
                    "fast-lan" => Config::fast_lan(),
                    "congested" => Config::congested(),
                    other => return Err(format!("알 수 없는 프리셋: {}", other)),
                };
                // 이미 지정한 인터페이스, 디렉터리는 유지
                cli.config = Config {
                    interface: cli.config.interface.clone(),
                    download_dir: cli.config.download_dir.clone(),
                    ..preset
                };
                i += 1;
            }
            "--no-encrypt" => cli.config.encryption_enabled = false,
            "--help" | "-h" => {
                println!("{}", HELP);
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 인자: {}", other)),
        }
        i += 1;
    }

    Ok(cli)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = parse_args()?;

    info!("Link-Chat starting...");
    info!("Interface: {}", cli.config.interface);
    info!("Download dir: {}", cli.config.download_dir.display());
    info!("Encryption: {}", cli.config.encryption_enabled);

    let discovery_wait = cli.config.discovery_interval() * 2;
    let (node, events) = Node::start(cli.config).await?;
    info!("Local MAC: {}", node.local_mac());

    match cli.command {
        Command::Listen => listen(&node, events).await,
        Command::Send => {
            let to = cli.to.ok_or("--to 필요")?;
            let destination: MacAddr = to.parse()?;

            // 상대 공개키를 받을 시간
            if !destination.is_broadcast() && node.peer_keys().get(&destination).is_none() {
                node.announce_key(destination).await?;
                tokio::time::sleep(discovery_wait).await;
            }

            if let Some(text) = &cli.text {
                let id = node.send_message(&to, text).await?;
                info!("메시지 전송 완료 (id={})", id);
            }
            if let Some(path) = &cli.path {
                let metadata = node.send_folder(&to, path).await?;
                info!(
                    "파일 전송 완료: {} ({} bytes, hash {})",
                    metadata.file_name,
                    metadata.size,
                    hex::encode(metadata.content_hash)
                );
            }
            if cli.text.is_none() && cli.path.is_none() {
                warn!("--text 또는 --path 필요");
            }
        }
        Command::Peers => {
            tokio::time::sleep(discovery_wait).await;
            let names = node.names()?;
            let peers = node.peers();
            println!("peers ({}):", peers.len());
            for mac in peers {
                println!("  {}  {}", mac, names.display(&mac));
            }
        }
    }

    node.stop();
    Ok(())
}

async fn listen(node: &Node, events: NodeEvents) {
    let NodeEvents {
        mut messages,
        mut files,
    } = events;
    let names = node.names().ok();
    let label = |mac: &MacAddr| match &names {
        Some(names) => names.display(mac),
        None => mac.to_string(),
    };

    info!("수신 대기 중... (Ctrl+C로 종료)");
    let mut progress = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            Some(message) = recv_opt(&mut messages) => {
                println!("[{}] {}", label(&message.source), message.text());
            }
            Some(file) = recv_opt(&mut files) => {
                println!(
                    "[{}] 파일 수신: {} ({} bytes) → {}",
                    label(&file.source),
                    file.name,
                    file.size,
                    file.path.display()
                );
            }
            _ = progress.tick() => {
                let peers: Vec<String> = node.peers().iter().map(|m| m.to_string()).collect();
                info!("peers: {:?}", peers);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("종료");
                break;
            }
        }
    }
}

/// 비활성화된 큐는 영원히 대기
async fn recv_opt<T>(rx: &mut Option<tokio::sync::mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
