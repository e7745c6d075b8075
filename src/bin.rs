use std::{net::SocketAddr, path::PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use dualsock::{BidirSocket, DualStackSocket, Endpoint, PacketInfo, SocketConfig, SocketKind};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON file with socket options
    #[clap(long)]
    config: Option<PathBuf>,
    /// Print one JSON object per event instead of plain text
    #[clap(long)]
    json: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept stream connections and echo what each peer sends
    Listen {
        #[clap(long, default_value = "::")]
        address: String,
        #[clap(long, default_value_t = 0)]
        port: u16,
        /// Stop after this many connections
        #[clap(long)]
        count: Option<usize>,
    },
    /// Connect to a host and exchange one message
    Connect {
        host: String,
        port: u16,
        #[clap(long, default_value = "hello")]
        message: String,
    },
    /// Receive datagrams and echo them back
    Receive {
        #[clap(long, default_value = "::")]
        address: String,
        #[clap(long, default_value_t = 0)]
        port: u16,
        /// Report where each datagram was delivered
        #[clap(long)]
        packet_info: bool,
        #[clap(long)]
        count: Option<usize>,
    },
    /// Send one datagram and wait for the echo
    Send {
        address: String,
        port: u16,
        message: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Report {
    Listening { local: SocketAddr },
    Accepted { remote: SocketAddr },
    Connected { remote: SocketAddr, local: SocketAddr },
    Received {
        remote: SocketAddr,
        bytes: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        packet_info: Option<PacketInfo>,
    },
    Reply { message: String },
}

struct Output {
    json: bool,
}

impl Output {
    fn report(&self, report: &Report) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            println!("{:?}", report);
        }
        Ok(())
    }
}

fn concrete(address: &str, port: u16) -> anyhow::Result<SocketAddr> {
    match Endpoint::parse(address, port) {
        Endpoint::Ip(addr) => Ok(addr),
        Endpoint::Host(..) => bail!("{} is not an IP address", address),
    }
}

fn open(config: &SocketConfig, kind: SocketKind) -> anyhow::Result<DualStackSocket> {
    let config = SocketConfig {
        kind,
        ..config.clone()
    };
    Ok(DualStackSocket::from_config(&config)?)
}

async fn echo_once<S: BidirSocket>(
    socket: &S,
    buf: &mut [u8],
) -> anyhow::Result<(usize, SocketAddr)> {
    let (n, from) = socket.recv_from(buf).await?;
    socket.send_to(&buf[..n], from).await?;
    Ok((n, from))
}

async fn listen(socket: DualStackSocket, out: &Output, count: Option<usize>) -> anyhow::Result<()> {
    socket.listen(128)?;
    out.report(&Report::Listening {
        local: socket.local_addr()?,
    })?;
    let mut served = 0;
    while count.map_or(true, |count| served < count) {
        let peer = socket.accept().await?;
        let remote = peer.remote_addr()?;
        out.report(&Report::Accepted { remote })?;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match peer.receive(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = peer.send(&buf[..n]).await {
                            log::warn!("echo to {} failed: {}", remote, e);
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("receive from {} failed: {}", remote, e);
                        break;
                    }
                }
            }
        });
        served += 1;
    }
    Ok(())
}

async fn receive(
    socket: DualStackSocket,
    out: &Output,
    packet_info: bool,
    count: Option<usize>,
) -> anyhow::Result<()> {
    out.report(&Report::Listening {
        local: socket.local_addr()?,
    })?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut served = 0;
    while count.map_or(true, |count| served < count) {
        let (bytes, remote, info) = if packet_info {
            let placeholder = SocketAddr::new(socket.local_addr()?.ip(), 0);
            let message = socket.receive_from_with_packet_info(&mut buf, placeholder).await?;
            socket.send_to(&buf[..message.len], message.remote).await?;
            (message.len, message.remote, message.packet_info)
        } else {
            let (bytes, remote) = echo_once(&socket, &mut buf).await?;
            (bytes, remote, None)
        };
        out.report(&Report::Received {
            remote,
            bytes,
            packet_info: info,
        })?;
        served += 1;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SocketConfig::load(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?,
        None => SocketConfig::default(),
    };
    let out = Output { json: args.json };

    match args.command {
        Command::Listen { address, port, count } => {
            let socket = open(&config, SocketKind::Stream)?;
            socket.bind(concrete(&address, port)?)?;
            listen(socket, &out, count).await?;
        }
        Command::Connect { host, port, message } => {
            let socket = open(&config, SocketKind::Stream)?;
            socket
                .connect(Endpoint::parse(&host, port))
                .await
                .with_context(|| format!("connecting to {}:{}", host, port))?;
            out.report(&Report::Connected {
                remote: socket.remote_addr()?,
                local: socket.local_addr()?,
            })?;
            socket.send(message.as_bytes()).await?;
            let mut buf = vec![0u8; 64 * 1024];
            let n = socket.receive(&mut buf).await?;
            out.report(&Report::Reply {
                message: String::from_utf8_lossy(&buf[..n]).into_owned(),
            })?;
        }
        Command::Receive {
            address,
            port,
            packet_info,
            count,
        } => {
            let socket = open(&config, SocketKind::Datagram)?;
            socket.bind(concrete(&address, port)?)?;
            receive(socket, &out, packet_info, count).await?;
        }
        Command::Send { address, port, message } => {
            let socket = open(&config, SocketKind::Datagram)?;
            let target = concrete(&address, port)?;
            socket.send_to(message.as_bytes(), target).await?;
            let mut buf = vec![0u8; 64 * 1024];
            let (n, remote) = socket.recv_from(&mut buf).await?;
            out.report(&Report::Received {
                remote,
                bytes: n,
                packet_info: None,
            })?;
            out.report(&Report::Reply {
                message: String::from_utf8_lossy(&buf[..n]).into_owned(),
            })?;
        }
    }
    Ok(())
}
