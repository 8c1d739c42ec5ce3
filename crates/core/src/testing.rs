//! In-memory collaborators for unit tests

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::auth::AccessToken;
use crate::error::ApiError;
use crate::gateway::{
    ApiResult, CloudGateway, Deployment, Device, DeviceGroup, LogStreamInfo, Product,
};
use crate::prompt::Prompter;
use crate::transport::{ChannelStream, LogStream, StreamFeeder};

pub fn fresh_token(value: &str) -> AccessToken {
    AccessToken::new(value, Utc::now() + Duration::hours(1)).with_refresh_token("refresh")
}

#[derive(Default)]
pub struct FakeState {
    /// Tokens accepted by token-protected calls; empty accepts anything
    pub valid_tokens: Vec<String>,
    pub devices: Vec<Device>,
    pub list_devices_error: Option<ApiError>,
    pub attach_error: Option<ApiError>,
    /// Returned once by the next restart
    pub restart_error: Option<ApiError>,
    pub refuse_open: bool,
    pub login_result: Option<ApiResult<AccessToken>>,
    pub refresh_result: Option<ApiResult<AccessToken>>,
    pub products: Vec<Product>,
    pub groups: Vec<DeviceGroup>,
    pub deployment_results: VecDeque<ApiResult<Deployment>>,
    pub latest: Option<Deployment>,
    /// Agent ids by device id
    pub agents: Vec<(String, String)>,

    pub list_devices_calls: usize,
    pub created_streams: usize,
    pub attached: Vec<(String, String)>,
    pub feeders: Vec<StreamFeeder>,
    pub deployments: Vec<(String, String, String)>,
    pub restarts: usize,
    pub refresh_calls: usize,
}

#[derive(Default)]
pub struct FakeGateway {
    pub state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn with_devices(ids: &[&str]) -> Self {
        let gateway = Self::default();
        gateway.state.lock().unwrap().devices = ids
            .iter()
            .map(|id| Device {
                id: id.to_string(),
                name: None,
            })
            .collect();
        gateway
    }

    pub fn set<F: FnOnce(&mut FakeState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn get<T, F: FnOnce(&FakeState) -> T>(&self, f: F) -> T {
        f(&self.state.lock().unwrap())
    }

    /// Feeder of the most recently opened stream
    pub fn feeder(&self) -> StreamFeeder {
        self.state.lock().unwrap().feeders.last().cloned().expect("no stream opened")
    }

    /// Queue bytes on the most recently opened stream
    pub fn feed(&self, text: &str) {
        self.feeder()
            .try_send(Bytes::from(text.to_string()))
            .expect("stream buffer full");
    }

    fn check(&self, token: &str) -> ApiResult<()> {
        let state = self.state.lock().unwrap();
        if state.valid_tokens.is_empty() || state.valid_tokens.iter().any(|t| t == token) {
            Ok(())
        } else {
            Err(ApiError::InvalidCredentials)
        }
    }
}

#[async_trait]
impl CloudGateway for FakeGateway {
    async fn login(&self, _id: &str, _password: &str) -> ApiResult<AccessToken> {
        self.state
            .lock()
            .unwrap()
            .login_result
            .clone()
            .unwrap_or_else(|| Ok(fresh_token("login-token")))
    }

    async fn refresh_access_token(&self, _refresh_token: &str) -> ApiResult<AccessToken> {
        let mut state = self.state.lock().unwrap();
        state.refresh_calls += 1;
        state
            .refresh_result
            .clone()
            .unwrap_or_else(|| Ok(fresh_token("refreshed-token")))
    }

    async fn list_products(&self, token: &str) -> ApiResult<Vec<Product>> {
        self.check(token)?;
        Ok(self.state.lock().unwrap().products.clone())
    }

    async fn list_device_groups(&self, token: &str, _product_id: &str) -> ApiResult<Vec<DeviceGroup>> {
        self.check(token)?;
        Ok(self.state.lock().unwrap().groups.clone())
    }

    async fn list_devices(
        &self,
        token: &str,
        _owner_id: Option<&str>,
        _group_id: Option<&str>,
    ) -> ApiResult<Vec<Device>> {
        self.check(token)?;
        let mut state = self.state.lock().unwrap();
        state.list_devices_calls += 1;
        match &state.list_devices_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.devices.clone()),
        }
    }

    async fn create_log_stream(&self, token: &str) -> ApiResult<LogStreamInfo> {
        self.check(token)?;
        let mut state = self.state.lock().unwrap();
        state.created_streams += 1;
        Ok(LogStreamInfo {
            id: format!("stream-{}", state.created_streams),
        })
    }

    async fn open_log_stream(
        &self,
        token: &str,
        _stream_id: &str,
    ) -> ApiResult<Option<Box<dyn LogStream>>> {
        self.check(token)?;
        let mut state = self.state.lock().unwrap();
        if state.refuse_open {
            return Ok(None);
        }
        let (feeder, stream) = ChannelStream::new(64);
        state.feeders.push(feeder);
        Ok(Some(Box::new(stream)))
    }

    async fn attach_device(&self, token: &str, stream_id: &str, device_id: &str) -> ApiResult<()> {
        self.check(token)?;
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.attach_error {
            return Err(err.clone());
        }
        state.attached.push((stream_id.to_string(), device_id.to_string()));
        Ok(())
    }

    async fn create_deployment(
        &self,
        token: &str,
        group_id: &str,
        agent_code: &str,
        device_code: &str,
    ) -> ApiResult<Deployment> {
        self.check(token)?;
        let mut state = self.state.lock().unwrap();
        state.deployments.push((
            group_id.to_string(),
            agent_code.to_string(),
            device_code.to_string(),
        ));
        state.deployment_results.pop_front().unwrap_or_else(|| {
            Ok(Deployment {
                id: "dep-1".into(),
                agent_code: agent_code.to_string(),
                device_code: device_code.to_string(),
            })
        })
    }

    async fn conditional_restart(&self, token: &str, _group_id: &str) -> ApiResult<()> {
        self.check(token)?;
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.restart_error.take() {
            return Err(err);
        }
        state.restarts += 1;
        Ok(())
    }

    async fn latest_deployment(&self, token: &str, _group_id: &str) -> ApiResult<Option<Deployment>> {
        self.check(token)?;
        Ok(self.state.lock().unwrap().latest.clone())
    }

    async fn device_agent_id(&self, token: &str, device_id: &str) -> ApiResult<Option<String>> {
        self.check(token)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .agents
            .iter()
            .find(|(device, _)| device == device_id)
            .map(|(_, agent)| agent.clone()))
    }
}

/// Prompter answering from a script; an exhausted script cancels
#[derive(Default)]
pub struct ScriptedPrompter {
    pub confirms: Mutex<VecDeque<bool>>,
    pub inputs: Mutex<VecDeque<String>>,
    pub picks: Mutex<VecDeque<usize>>,
    pub asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn confirm_with(self, answers: &[bool]) -> Self {
        self.confirms.lock().unwrap().extend(answers.iter().copied());
        self
    }

    pub fn input_with(self, answers: &[&str]) -> Self {
        self.inputs
            .lock()
            .unwrap()
            .extend(answers.iter().map(|s| s.to_string()));
        self
    }

    pub fn pick_with(self, answers: &[usize]) -> Self {
        self.picks.lock().unwrap().extend(answers.iter().copied());
        self
    }

    fn note(&self, prompt: &str) {
        self.asked.lock().unwrap().push(prompt.to_string());
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn confirm(&self, message: &str) -> bool {
        self.note(message);
        self.confirms.lock().unwrap().pop_front().unwrap_or(false)
    }

    async fn input(&self, prompt: &str, _default: Option<&str>) -> Option<String> {
        self.note(prompt);
        self.inputs.lock().unwrap().pop_front()
    }

    async fn secret(&self, prompt: &str) -> Option<String> {
        self.note(prompt);
        self.inputs.lock().unwrap().pop_front()
    }

    async fn pick(&self, title: &str, _items: &[String]) -> Option<usize> {
        self.note(title);
        self.picks.lock().unwrap().pop_front()
    }
}
