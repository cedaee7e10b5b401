//! In-process transport fakes for executor and queue tests

use crate::transport::traits::{
    ExecOutput, InboundMessage, MqttConnector, MqttSession, ReachabilityProbe, SshConnector,
    SshSession, SshTarget, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use fleet_shared::codec::{self, ResponseEnvelope};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the fake SSH server does
#[derive(Debug, Clone)]
pub(crate) enum SshScript {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    ConnectError(TransportError),
    ExecError(TransportError),
    /// Connect never completes
    Stall,
}

/// Records every connect and command line
pub(crate) struct FakeSshConnector {
    script: SshScript,
    targets: Mutex<Vec<SshTarget>>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl FakeSshConnector {
    pub(crate) fn new(script: SshScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            targets: Mutex::new(Vec::new()),
            executed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn exiting(code: i32, stdout: &str, stderr: &str) -> Arc<Self> {
        Self::new(SshScript::Exit {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        })
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.targets.lock().unwrap().len()
    }

    pub(crate) fn targets(&self) -> Vec<SshTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SshConnector for FakeSshConnector {
    async fn connect(
        &self,
        target: &SshTarget,
        _ready_timeout: Duration,
    ) -> Result<Box<dyn SshSession>, TransportError> {
        self.targets.lock().unwrap().push(target.clone());
        match &self.script {
            SshScript::ConnectError(e) => Err(e.clone()),
            SshScript::Stall => std::future::pending().await,
            script => {
                let session: Box<dyn SshSession> = Box::new(FakeSshSession {
                    script: script.clone(),
                    executed: self.executed.clone(),
                });
                Ok(session)
            }
        }
    }

    fn name(&self) -> &'static str {
        "fake-ssh"
    }
}

struct FakeSshSession {
    script: SshScript,
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SshSession for FakeSshSession {
    async fn exec(&mut self, command_line: &str) -> Result<ExecOutput, TransportError> {
        self.executed.lock().unwrap().push(command_line.to_string());
        match &self.script {
            SshScript::Exit {
                code,
                stdout,
                stderr,
            } => Ok(ExecOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                exit_code: *code,
            }),
            SshScript::ExecError(e) => Err(e.clone()),
            _ => Err(TransportError::Protocol("unexpected script".into())),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// How the fake device answers a published command
#[derive(Debug, Clone)]
pub(crate) enum MqttReply {
    /// Answer with the correlation id of the published command
    Matching {
        success: bool,
        exit_code: Option<i32>,
        output: Option<String>,
        error: Option<String>,
    },
    /// Answer carrying someone else's id
    Foreign { id: String, success: bool },
    /// Bytes that are not a response envelope
    Garbage(Vec<u8>),
}

impl MqttReply {
    pub(crate) fn ok(output: &str) -> Self {
        MqttReply::Matching {
            success: true,
            exit_code: Some(0),
            output: Some(output.into()),
            error: None,
        }
    }
}

/// A broker with one scripted device behind it
pub(crate) struct FakeBroker {
    replies: Vec<MqttReply>,
    connect_error: Option<TransportError>,
    connects: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl FakeBroker {
    pub(crate) fn new(replies: Vec<MqttReply>) -> Arc<Self> {
        Arc::new(Self {
            replies,
            ..Self::empty()
        })
    }

    pub(crate) fn unreachable(error: TransportError) -> Arc<Self> {
        Arc::new(Self {
            connect_error: Some(error),
            ..Self::empty()
        })
    }

    fn empty() -> Self {
        Self {
            replies: Vec::new(),
            connect_error: None,
            connects: AtomicUsize::new(0),
            disconnects: Arc::new(AtomicUsize::new(0)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl MqttConnector for FakeBroker {
    async fn connect(&self, _client_id: &str) -> Result<Box<dyn MqttSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.connect_error {
            return Err(e.clone());
        }
        Ok(Box::new(FakeMqttSession {
            replies: self.replies.clone(),
            inbox: VecDeque::new(),
            subscriptions: self.subscriptions.clone(),
            published: self.published.clone(),
            disconnects: self.disconnects.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "fake-mqtt"
    }
}

struct FakeMqttSession {
    replies: Vec<MqttReply>,
    inbox: VecDeque<InboundMessage>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl MqttSession for FakeMqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));

        let command = codec::decode_command(&payload)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let response_topic = topic.replace("/commands", "/responses");

        for reply in &self.replies {
            let payload = match reply {
                MqttReply::Matching {
                    success,
                    exit_code,
                    output,
                    error,
                } => {
                    let envelope = ResponseEnvelope {
                        id: command.id.clone(),
                        success: *success,
                        output: output.clone(),
                        error: error.clone(),
                        exit_code: *exit_code,
                    };
                    codec::encode_response(&envelope).unwrap().to_vec()
                }
                MqttReply::Foreign { id, success } => {
                    let envelope = ResponseEnvelope {
                        id: id.clone(),
                        success: *success,
                        output: None,
                        error: None,
                        exit_code: None,
                    };
                    codec::encode_response(&envelope).unwrap().to_vec()
                }
                MqttReply::Garbage(bytes) => bytes.clone(),
            };
            self.inbox.push_back(InboundMessage {
                topic: response_topic.clone(),
                payload,
            });
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        match self.inbox.pop_front() {
            Some(msg) => Ok(Some(msg)),
            // Silent device: wait forever
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Probe with a fixed answer
pub(crate) struct StaticProbe {
    reachable: bool,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub(crate) fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable,
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn is_reachable(&self, _host: &str, _port: u16, _deadline: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reachable
    }
}
