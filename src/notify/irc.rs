//! IRC delivery
//!
//! Connect → register → join → say → quit, over TCP or TLS, with a 30s
//! connect budget. The connection lives exactly as long as one message.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on registration chatter before we give up waiting for the welcome
const MAX_REGISTRATION_LINES: usize = 200;

pub async fn send(config: &serde_json::Value, message: &str) -> anyhow::Result<()> {
    let host = config
        .get("host")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("irc config is missing \"host\""))?;
    let channel = config
        .get("channel")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("irc config is missing \"channel\""))?;
    let nick = config
        .get("nick")
        .and_then(|v| v.as_str())
        .unwrap_or("vigil-alerts");
    let password = config.get("password").and_then(|v| v.as_str());
    let tls = config.get("tls").and_then(|v| v.as_bool()).unwrap_or(false);
    let port = config
        .get("port")
        .and_then(|v| v.as_u64())
        .unwrap_or(if tls { 6697 } else { 6667 }) as u16;

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow::anyhow!("IRC connect to {host}:{port} timed out"))??;

    if tls {
        use rustls::pki_types::ServerName;
        let server_name = ServerName::try_from(host.to_string())?;
        let connector =
            tokio_rustls::TlsConnector::from(Arc::new(crate::executor::tls::noverify_config()));
        let stream = connector.connect(server_name, stream).await?;
        converse(stream, nick, password, channel, message).await
    } else {
        converse(stream, nick, password, channel, message).await
    }
}

async fn converse<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    nick: &str,
    password: Option<&str>,
    channel: &str,
    message: &str,
) -> anyhow::Result<()> {
    let mut stream = BufReader::new(stream);

    if let Some(password) = password {
        stream.write_all(format!("PASS {password}\r\n").as_bytes()).await?;
    }
    stream
        .write_all(format!("NICK {nick}\r\nUSER {nick} 0 * :{nick}\r\n").as_bytes())
        .await?;

    // Wait for the 001 welcome, answering pings along the way
    let mut line = String::new();
    for _ in 0..MAX_REGISTRATION_LINES {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            anyhow::bail!("IRC server closed connection during registration");
        }
        trace!("irc <- {}", line.trim_end());

        if let Some(token) = line.strip_prefix("PING ") {
            stream
                .write_all(format!("PONG {}\r\n", token.trim_end()).as_bytes())
                .await?;
            continue;
        }
        // ":server 001 nick :Welcome..."
        if line.split_whitespace().nth(1) == Some("001") {
            break;
        }
        if line.contains(" 433 ") {
            anyhow::bail!("IRC nickname {nick:?} already in use");
        }
        if line.contains("ERROR") {
            anyhow::bail!("IRC server rejected registration: {}", line.trim_end());
        }
    }

    let channel = if channel.starts_with('#') {
        channel.to_string()
    } else {
        format!("#{channel}")
    };
    stream.write_all(format!("JOIN {channel}\r\n").as_bytes()).await?;

    for text_line in message.lines().filter(|l| !l.is_empty()) {
        stream
            .write_all(format!("PRIVMSG {channel} :{text_line}\r\n").as_bytes())
            .await?;
    }

    stream.write_all(b"QUIT :done\r\n").await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_registration_join_say_quit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut collected = String::new();
            let mut line = String::new();

            // NICK + USER
            for _ in 0..2 {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                collected.push_str(&line);
            }
            reader
                .write_all(b":srv 001 vigil-alerts :Welcome\r\n")
                .await
                .unwrap();

            // JOIN, PRIVMSG, QUIT
            for _ in 0..3 {
                line.clear();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                collected.push_str(&line);
            }
            collected
        });

        let config = serde_json::json!({
            "host": "127.0.0.1",
            "port": addr.port(),
            "channel": "ops",
        });
        send(&config, "🔴 api is down").await.unwrap();

        let transcript = server.await.unwrap();
        assert!(transcript.contains("NICK vigil-alerts"));
        assert!(transcript.contains("JOIN #ops"));
        assert!(transcript.contains("PRIVMSG #ops :🔴 api is down"));
    }
}
