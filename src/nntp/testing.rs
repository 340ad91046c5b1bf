//! In-process NNTP server used by connection and engine tests
//!
//! Thread-per-connection over std sockets, scriptable per scenario: refuse
//! authentication, delay or reject posts, drop the socket mid-exchange,
//! answer STAT probes from a closure.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::ServerConfig;

/// Reply to one complete POST exchange (decided after the body arrived).
pub enum PostReply {
    Accept,
    Reject(u16),
    Drop,
}

type DropOnPost = Arc<dyn Fn(usize) -> bool + Send + Sync>;
type RespondPost = Arc<dyn Fn(usize, &str) -> PostReply + Send + Sync>;
type StatExists = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct ServerBehavior {
    pub accept_auth: bool,
    /// Artificial processing time per accepted article.
    pub post_delay: Duration,
    /// Close the socket right after the POST command, before the 340.
    pub drop_on_post: DropOnPost,
    /// Final status for a received article, by global post sequence.
    pub respond_post: RespondPost,
    pub stat_exists: StatExists,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            accept_auth: true,
            post_delay: Duration::ZERO,
            drop_on_post: Arc::new(|_| false),
            respond_post: Arc::new(|_, _| PostReply::Accept),
            stat_exists: Arc::new(|_| true),
        }
    }
}

pub struct FakeServer {
    port: u16,
    /// Raw article text (headers + framed body) of every POST that got a 340.
    pub posts: Arc<Mutex<Vec<String>>>,
    /// Accepted TCP sessions.
    pub sessions: Arc<AtomicUsize>,
}

impl FakeServer {
    pub fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let posts = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let behavior = Arc::new(behavior);
        let post_seq = Arc::new(AtomicUsize::new(0));

        {
            let posts = Arc::clone(&posts);
            let sessions = Arc::clone(&sessions);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    sessions.fetch_add(1, Ordering::SeqCst);
                    let posts = Arc::clone(&posts);
                    let behavior = Arc::clone(&behavior);
                    let post_seq = Arc::clone(&post_seq);
                    thread::spawn(move || {
                        let _ = serve(stream, &behavior, &posts, &post_seq);
                    });
                }
            });
        }

        Self {
            port,
            posts,
            sessions,
        }
    }

    pub fn server_config(&self, connections: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            username: "user".to_string(),
            password: "secret".to_string(),
            tls: false,
            verify_certs: false,
            connections,
        }
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

fn serve(
    mut stream: TcpStream,
    behavior: &ServerBehavior,
    posts: &Mutex<Vec<String>>,
    post_seq: &AtomicUsize,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    stream.write_all(b"200 fake news server ready\r\n")?;

    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(trim_crlf(&line)).into_owned();

        if text.starts_with("AUTHINFO USER") {
            stream.write_all(b"381 password required\r\n")?;
        } else if text.starts_with("AUTHINFO PASS") {
            if behavior.accept_auth {
                stream.write_all(b"281 authentication accepted\r\n")?;
            } else {
                stream.write_all(b"502 authentication failed\r\n")?;
            }
        } else if text == "POST" {
            let seq = post_seq.fetch_add(1, Ordering::SeqCst);
            if (behavior.drop_on_post)(seq) {
                return Ok(());
            }
            stream.write_all(b"340 send article to be posted\r\n")?;

            let article = read_article(&mut reader)?;
            posts.lock().unwrap().push(article.clone());

            if !behavior.post_delay.is_zero() {
                thread::sleep(behavior.post_delay);
            }
            match (behavior.respond_post)(seq, &article) {
                PostReply::Accept => stream.write_all(b"240 article received ok\r\n")?,
                PostReply::Reject(code) => {
                    stream.write_all(format!("{code} posting failed\r\n").as_bytes())?
                }
                PostReply::Drop => return Ok(()),
            }
        } else if let Some(message_id) = text.strip_prefix("STAT ") {
            if (behavior.stat_exists)(message_id) {
                stream.write_all(format!("223 0 {message_id}\r\n").as_bytes())?;
            } else {
                stream.write_all(b"430 no such article\r\n")?;
            }
        } else if text == "QUIT" {
            stream.write_all(b"205 goodbye\r\n")?;
            return Ok(());
        } else {
            stream.write_all(b"500 command not recognized\r\n")?;
        }
    }
}

fn read_article(reader: &mut BufReader<TcpStream>) -> std::io::Result<String> {
    let mut article = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(article);
        }
        let stripped = trim_crlf(&line);
        if stripped == b"." {
            return Ok(article);
        }
        article.push_str(&String::from_utf8_lossy(stripped));
        article.push('\n');
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}
