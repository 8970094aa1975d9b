//! Scripted network used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::http::{Request, Response};
use crate::net::{Network, NetworkError};

#[derive(Debug, Clone)]
enum Reply {
  Status(u16, String),
  Unreachable,
}

#[derive(Default)]
struct Script {
  /// Replies per path, consumed in order; the last one repeats
  replies: HashMap<String, VecDeque<Reply>>,
  requests: Vec<Request>,
  /// Time every request spends in flight
  latency: Option<Duration>,
}

/// Network whose replies are queued per path. Unscripted paths are
/// unreachable.
#[derive(Clone, Default)]
pub struct ScriptedNetwork {
  script: Arc<Mutex<Script>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, status: u16, body: &str) -> &Self {
    self.push(path, Reply::Status(status, body.to_string()))
  }

  pub fn fail(&self, path: &str) -> &Self {
    self.push(path, Reply::Unreachable)
  }

  /// Make every request take `latency` before it is answered.
  pub fn delay(&self, latency: Duration) -> &Self {
    self.script.lock().unwrap().latency = Some(latency);
    self
  }

  fn push(&self, path: &str, reply: Reply) -> &Self {
    self
      .script
      .lock()
      .unwrap()
      .replies
      .entry(path.to_string())
      .or_default()
      .push_back(reply);
    self
  }

  /// Every request seen so far.
  pub fn requests(&self) -> Vec<Request> {
    self.script.lock().unwrap().requests.clone()
  }

  pub fn request_count(&self, path: &str) -> usize {
    self
      .script
      .lock()
      .unwrap()
      .requests
      .iter()
      .filter(|r| r.path() == path)
      .count()
  }
}

impl Network for ScriptedNetwork {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
    let path = request.path().to_string();
    let (reply, latency) = {
      let mut script = self.script.lock().unwrap();
      script.requests.push(request);

      let reply = match script.replies.get_mut(&path) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
      };
      (reply, script.latency)
    };

    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    match reply {
      Some(Reply::Status(status, body)) => Ok(Response::new(
        status,
        vec![("content-type".to_string(), "text/plain".to_string())],
        body,
      )),
      Some(Reply::Unreachable) | None => Err(NetworkError::Unreachable(format!(
        "no route to {}",
        path
      ))),
    }
  }
}
