#![allow(dead_code)]

//! In-memory stand-ins for the resource store and the pod exec capability

use async_trait::async_trait;
use dump_controller::tasks::exec::{ExecOutput, PodExec, PodRef};
use dump_controller::tasks::store::ResourceStore;
use dump_controller::{
    CaptureKind, ControllerConfig, DumpRequest, DumpRequestSpec, DumpRequestStatus, Error, Result,
};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Once};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.dump.poll_interval_seconds = 2;
    config.dump.detection_timeout_seconds = 30;
    config
}

pub fn dump_request(namespace: &str, name: &str, pod: &str, include: &[CaptureKind]) -> DumpRequest {
    let mut dump = DumpRequest::new(
        name,
        DumpRequestSpec {
            pod_name: pod.to_string(),
            include: include.to_vec(),
            container: None,
        },
    );
    dump.metadata.namespace = Some(namespace.to_string());
    dump
}

fn conflict() -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified; please apply your changes to the latest version"
            .to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

type PendingEdit = Box<dyn FnOnce(&mut DumpRequest) + Send>;

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, DumpRequest>,
    history: HashMap<String, Vec<DumpRequestStatus>>,
    injected_conflicts: u32,
    next_version: u64,
    /// Reads left to serve untouched, then an edit made by another writer
    pending_edit: Option<(u32, String, PendingEdit)>,
}

/// Resource store with optimistic concurrency on `resourceVersion`
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn insert(&self, mut dump: DumpRequest) -> DumpRequest {
        let mut state = self.state.lock().unwrap();
        state.next_version += 1;
        dump.metadata.resource_version = Some(state.next_version.to_string());
        state.objects.insert(dump.object_key(), dump.clone());
        dump
    }

    pub fn current(&self, key: &str) -> Option<DumpRequest> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn delete(&self, key: &str) {
        self.state.lock().unwrap().objects.remove(key);
    }

    /// Every status successfully written for `key`, oldest first
    pub fn history(&self, key: &str) -> Vec<DumpRequestStatus> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Make the next `count` status writes lose to a concurrent writer
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().unwrap().injected_conflicts = count;
    }

    /// Let another writer change `key` once `skip_reads` reads have been served
    pub fn edit_after_reads(
        &self,
        key: &str,
        skip_reads: u32,
        edit: impl FnOnce(&mut DumpRequest) + Send + 'static,
    ) {
        self.state.lock().unwrap().pending_edit = Some((skip_reads, key.to_string(), Box::new(edit)));
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DumpRequest>> {
        let key = format!("{namespace}/{name}");
        let mut state = self.state.lock().unwrap();

        let due = match state.pending_edit.as_mut() {
            Some((skip, edit_key, _)) if *edit_key == key => {
                if *skip == 0 {
                    true
                } else {
                    *skip -= 1;
                    false
                }
            }
            _ => false,
        };
        if due {
            if let Some((_, _, edit)) = state.pending_edit.take() {
                state.next_version += 1;
                let version = state.next_version.to_string();
                if let Some(stored) = state.objects.get_mut(&key) {
                    edit(stored);
                    stored.metadata.resource_version = Some(version);
                }
            }
        }

        Ok(state.objects.get(&key).cloned())
    }

    async fn replace_status(&self, dump: &DumpRequest) -> Result<DumpRequest> {
        let key = dump.object_key();
        let mut state = self.state.lock().unwrap();
        state.next_version += 1;
        let version = state.next_version.to_string();

        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            if let Some(stored) = state.objects.get_mut(&key) {
                stored.metadata.resource_version = Some(version);
            }
            return Err(conflict());
        }

        let Some(stored) = state.objects.get_mut(&key) else {
            return Err(Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("dumprequests \"{}\" not found", dump.name_any()),
                reason: "NotFound".to_string(),
                code: 404,
            })));
        };
        if stored.metadata.resource_version != dump.metadata.resource_version {
            return Err(conflict());
        }

        stored.status = dump.status.clone();
        stored.metadata.resource_version = Some(version);
        let stored = stored.clone();
        state
            .history
            .entry(key)
            .or_default()
            .push(stored.status.clone().unwrap_or_default());
        Ok(stored)
    }
}

/// How a pod answers the dump command
#[derive(Clone, Debug)]
pub enum DispatchBehavior {
    Accept,
    /// Non-zero exit for the next `n` dispatches, then accept
    RejectTimes(u32),
    /// Exec transport failure for the next `n` dispatches, then accept
    UnreachableTimes(u32),
}

#[derive(Debug)]
struct FakePod {
    behavior: DispatchBehavior,
    /// directory -> entries in `ls -1tp` format, newest first
    dirs: BTreeMap<String, Vec<String>>,
    archives: HashMap<String, Vec<String>>,
    dispatches: u32,
    failing_listings: u32,
}

#[derive(Default)]
struct ClusterState {
    pods: HashMap<(String, String), FakePod>,
    calls: Vec<(String, Vec<String>)>,
}

/// Pods with a tiny directory tree, driven by the commands the controller sends
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn add_pod(&self, namespace: &str, name: &str, behavior: DispatchBehavior) {
        self.state.lock().unwrap().pods.insert(
            (namespace.to_string(), name.to_string()),
            FakePod {
                behavior,
                dirs: BTreeMap::new(),
                archives: HashMap::new(),
                dispatches: 0,
                failing_listings: 0,
            },
        );
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Make the next `count` directory listings in `pod` fail with a non-zero exit
    pub fn fail_listings(&self, namespace: &str, pod: &str, count: u32) {
        if let Some(pod) = self
            .state
            .lock()
            .unwrap()
            .pods
            .get_mut(&(namespace.to_string(), pod.to_string()))
        {
            pod.failing_listings = count;
        }
    }

    /// Capture directories under the namespace root, newest first
    pub fn capture_dirs(&self, namespace: &str, pod: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .and_then(|p| p.dirs.get(&format!("serviceability/{namespace}")))
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| e.trim_end_matches('/').to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Write an archive into `<root>/<namespace>/<capture_dir>/` as the newest entry
    pub fn publish_archive(
        &self,
        namespace: &str,
        pod: &str,
        capture_dir: &str,
        file: &str,
        entries: &[&str],
    ) {
        let mut state = self.state.lock().unwrap();
        let pod = state
            .pods
            .get_mut(&(namespace.to_string(), pod.to_string()))
            .expect("pod registered");

        let root = format!("serviceability/{namespace}");
        let dir = format!("{root}/{capture_dir}");
        let listing = pod.dirs.entry(root).or_default();
        listing.retain(|e| e != &format!("{capture_dir}/"));
        listing.insert(0, format!("{capture_dir}/"));
        pod.dirs.entry(dir.clone()).or_default().insert(0, file.to_string());
        pod.archives.insert(
            format!("{dir}/{file}"),
            entries.iter().map(|e| (*e).to_string()).collect(),
        );
    }

    /// Successful dump commands received by `pod`
    pub fn dispatches(&self, namespace: &str, pod: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .map_or(0, |p| p.dispatches)
    }

    /// Every command sent to any pod
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn dump_commands(&self, pod: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(p, command)| p == pod && command[0] == "/bin/sh")
            .count()
    }
}

fn output(stdout: String, stderr: &str, exit_code: i32) -> ExecOutput {
    ExecOutput {
        stdout,
        stderr: stderr.to_string(),
        exit_code,
    }
}

fn mkdir_target(script: &str) -> Option<String> {
    let rest = script.strip_prefix("mkdir -p '")?;
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

#[async_trait]
impl PodExec for FakeCluster {
    async fn exec(&self, target: &PodRef, command: &[String]) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push((target.name.clone(), command.to_vec()));

        let Some(pod) = state
            .pods
            .get_mut(&(target.namespace.clone(), target.name.clone()))
        else {
            return Err(Error::NotFound(format!(
                "pod {} does not exist in namespace {}",
                target.name, target.namespace
            )));
        };

        match command[0].as_str() {
            "/bin/sh" => {
                match &mut pod.behavior {
                    DispatchBehavior::RejectTimes(n) if *n > 0 => {
                        *n -= 1;
                        return Ok(output(String::new(), "server: command not ready", 1));
                    }
                    DispatchBehavior::UnreachableTimes(n) if *n > 0 => {
                        *n -= 1;
                        return Err(Error::TransientExec(format!(
                            "pod {} is in phase Pending, not Running",
                            target.name
                        )));
                    }
                    _ => {}
                }
                pod.dispatches += 1;
                if let Some(dir) = mkdir_target(&command[2]) {
                    if let Some((root, leaf)) = dir.rsplit_once('/') {
                        let listing = pod.dirs.entry(root.to_string()).or_default();
                        let entry = format!("{leaf}/");
                        if !listing.contains(&entry) {
                            listing.insert(0, entry);
                        }
                        pod.dirs.entry(dir.clone()).or_default();
                    }
                }
                Ok(output(String::new(), "", 0))
            }
            "ls" => {
                let dir = &command[2];
                if pod.failing_listings > 0 {
                    pod.failing_listings -= 1;
                    return Ok(output(
                        String::new(),
                        &format!("ls: cannot open directory '{dir}': Permission denied"),
                        2,
                    ));
                }
                Ok(match pod.dirs.get(dir) {
                    Some(entries) => output(entries.join("\n"), "", 0),
                    None => output(
                        String::new(),
                        &format!("ls: cannot access '{dir}': No such file or directory"),
                        2,
                    ),
                })
            }
            "unzip" => {
                let path = &command[2];
                Ok(match pod.archives.get(path) {
                    Some(entries) => {
                        let mut table = format!(
                            "Archive:  {path}\n  Length      Date    Time    Name\n---------  ---------- -----   ----\n"
                        );
                        for entry in entries {
                            table.push_str(&format!("     1024  01-01-2024 12:00   {entry}\n"));
                        }
                        table.push_str("---------                     -------\n");
                        output(table, "", 0)
                    }
                    None => output(String::new(), &format!("unzip:  cannot find {path}"), 9),
                })
            }
            other => Ok(output(String::new(), &format!("{other}: not found"), 127)),
        }
    }
}
