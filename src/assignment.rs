use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};

use crate::event::LogEntry;
use crate::remote_client::RemoteClient;
use crate::{ChoiceSource, Result, Store};

/// Tests are limited to this many variants. Extra variants are never chosen.
pub const MAX_VARIANTS: usize = 10;

/// Failure type recorded when a test is run without any variants.
pub const FAILURE_NO_VARIANTS: &str = "no-variants";
/// Failure type recorded when remote test data is neither an object nor `null`.
pub const FAILURE_MALFORMED_DATA: &str = "malformed-data";

const METHOD_GET_TEST_DATA: &str = "getTestData";
const METHOD_SEND_AB_LOGS: &str = "sendABLogs";
const METHOD_SEND_LOGS: &str = "stats";

/// Sticky variant assignment and the A/B event trail.
///
/// Persistence and network errors never reach the caller of the business operations here: they
/// are logged and the operation degrades to a non-sticky choice or empty data.
pub(crate) struct Assignments {
    store: Arc<Store>,
    remote: Arc<dyn RemoteClient + Send + Sync>,
    chooser: Mutex<Box<dyn ChoiceSource + Send>>,
    installation_id: String,
}

impl Assignments {
    pub(crate) fn new(
        store: Arc<Store>,
        remote: Arc<dyn RemoteClient + Send + Sync>,
        chooser: Box<dyn ChoiceSource + Send>,
        installation_id: String,
    ) -> Assignments {
        Assignments {
            store,
            remote,
            chooser: Mutex::new(chooser),
            installation_id,
        }
    }

    pub(crate) fn installation_id(&self) -> &str {
        &self.installation_id
    }

    /// Variant of `test_name` for this installation, assigning one on first evaluation.
    ///
    /// Returns `None` only when there are no variants to choose from.
    pub(crate) fn choose(&self, test_name: &str, num_choices: usize) -> Option<usize> {
        match num_choices {
            0 => {
                log::warn!(target: "clutch", test_name; "test has no variants");
                self.test_failure(test_name, FAILURE_NO_VARIANTS);
                return None;
            }
            1 => {
                log::trace!(target: "clutch", test_name; "single-variant test, nothing to assign");
                return Some(0);
            }
            n if n > MAX_VARIANTS => {
                log::warn!(target: "clutch",
                           test_name,
                           num_choices;
                           "test has more than {} variants, extra variants are ignored", MAX_VARIANTS);
            }
            _ => {}
        }
        let num_choices = num_choices.min(MAX_VARIANTS);

        match self
            .store
            .assign_choice(test_name, num_choices, |n| self.pick(n))
        {
            Ok(assignment) => {
                log::trace!(target: "clutch",
                            test_name,
                            num_choices,
                            choice = assignment.choice(),
                            new = assignment.is_new();
                            "evaluated test");
                Some(assignment.choice())
            }
            Err(err) => {
                log::warn!(target: "clutch",
                           test_name;
                           "failed to persist assignment, choosing without stickiness: {:?}", err);
                Some(self.pick(num_choices))
            }
        }
    }

    /// Remote data for the data-only test `test_name`. Empty if there is none or it could not be
    /// fetched.
    pub(crate) fn fetch_test_data(&self, test_name: &str) -> Map<String, Value> {
        if let Err(err) = self.store.set_num_choices(test_name, 1, true) {
            log::warn!(target: "clutch", test_name; "failed to record test metadata: {:?}", err);
        }

        let mut params = Map::new();
        params.insert("guid".to_owned(), self.installation_id.clone().into());
        params.insert("name".to_owned(), test_name.into());

        match self.remote.call_method(METHOD_GET_TEST_DATA, &params) {
            Ok(Value::Object(data)) => data,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                log::warn!(target: "clutch", test_name; "malformed test data: {}", other);
                self.test_failure(test_name, FAILURE_MALFORMED_DATA);
                Map::new()
            }
            Err(err) => {
                log::warn!(target: "clutch", test_name; "failed to fetch test data: {:?}", err);
                Map::new()
            }
        }
    }

    pub(crate) fn goal_reached(&self, name: &str) {
        if let Err(err) = self.store.goal_reached(name) {
            log::warn!(target: "clutch", name; "failed to record goal: {:?}", err);
        }
    }

    pub(crate) fn test_failure(&self, test_name: &str, failure_type: &str) {
        if let Err(err) = self.store.test_failure(test_name, failure_type) {
            log::warn!(target: "clutch", test_name, failure_type; "failed to record test failure: {:?}", err);
        }
    }

    pub(crate) fn log_event(&self, action: &str, data: Option<Value>) {
        if let Err(err) = self.store.log(action, data) {
            log::warn!(target: "clutch", action; "failed to record event: {:?}", err);
        }
    }

    /// Upload the A/B log and delete what was uploaded. Returns the number of uploaded entries.
    pub(crate) fn flush_ab_logs(&self) -> Result<usize> {
        self.upload(METHOD_SEND_AB_LOGS, self.store.get_ab_logs()?, |last| {
            self.store.delete_ab_logs_through(last)
        })
    }

    /// Upload the generic event log and delete what was uploaded. Returns the number of uploaded
    /// entries.
    pub(crate) fn flush_logs(&self) -> Result<usize> {
        self.upload(METHOD_SEND_LOGS, self.store.get_logs()?, |last| {
            self.store.delete_logs_through(last)
        })
    }

    fn upload(
        &self,
        method: &str,
        logs: Vec<LogEntry>,
        purge: impl FnOnce(&LogEntry) -> Result<usize>,
    ) -> Result<usize> {
        let Some(last) = logs.last() else {
            return Ok(0);
        };

        let mut params = Map::new();
        params.insert("guid".to_owned(), self.installation_id.clone().into());
        params.insert("logs".to_owned(), serde_json::to_value(&logs)?);
        self.remote.call_method(method, &params)?;

        let purged = purge(last)?;
        log::debug!(target: "clutch", method, uploaded = logs.len(), purged; "uploaded logs");
        Ok(logs.len())
    }

    fn pick(&self, num_choices: usize) -> usize {
        let mut chooser = self.chooser.lock().unwrap_or_else(PoisonError::into_inner);
        chooser.choose(num_choices) % num_choices
    }
}
