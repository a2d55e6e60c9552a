//! CV-020: Engine facade.
//!
//! Wires configuration, the driver registry, the system caller, module
//! fetching and the keystore into load → plan → apply → healthcheck.

use super::config::EngineConfig;
use super::error::Result;
use super::executor::{Executor, Mode};
use super::health;
use super::loader::{DefaultFetcher, Fetcher, Loader};
use super::types::VertexValue;
use crate::graph::{CancelToken, Graph, WalkOptions};
use crate::keystore::Keystore;
use crate::resources::Registry;
use crate::transport::{LocalSysCaller, SysCaller};
use indexmap::IndexMap;
use std::sync::Arc;

pub struct Engine {
    config: EngineConfig,
    registry: Registry,
    sys: Arc<dyn SysCaller>,
    fetcher: Arc<dyn Fetcher>,
    keystore: Keystore,
    cancel: CancelToken,
}

impl Engine {
    /// Built-in drivers, the host shell, local and HTTP fetching.
    pub fn new(config: EngineConfig) -> Self {
        let keystore = Keystore::from_config(&config.keystore);
        Self {
            config,
            registry: Registry::builtin(),
            sys: Arc::new(LocalSysCaller::new()),
            fetcher: Arc::new(DefaultFetcher::default()),
            keystore,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_sys(mut self, sys: Arc<dyn SysCaller>) -> Self {
        self.sys = sys;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn walk_options(&self) -> WalkOptions {
        WalkOptions::with_workers(self.config.workers).cancel(self.cancel.clone())
    }

    fn executor(&self) -> Executor {
        Executor::new(self.registry.clone(), self.sys.clone(), self.walk_options())
    }

    /// Parse, expand and validate a module into a graph. Nothing runs.
    pub fn load(&self, source: &str, args: &IndexMap<String, String>) -> Result<Graph<VertexValue>> {
        Loader::new(self.fetcher.as_ref(), &self.registry)
            .keystore(&self.keystore)
            .verify_modules(self.config.verify_modules)
            .load(source, args)
    }

    pub fn plan(&self, graph: &Graph<VertexValue>) -> Result<Graph<VertexValue>> {
        self.executor().run(Mode::Plan, graph)
    }

    pub fn apply(&self, graph: &Graph<VertexValue>) -> Result<Graph<VertexValue>> {
        self.executor().run(Mode::Apply, graph)
    }

    /// Health of a planned or applied graph.
    pub fn healthcheck(&self, evaluated: &Graph<VertexValue>) -> Result<Graph<VertexValue>> {
        health::check(evaluated, &self.walk_options())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::core::executor::{exports, Summary};
    use crate::core::loader::MemoryFetcher;
    use crate::core::resolver::Renderer;
    use crate::core::types::{HealthLevel, PipelineStage, TaskStatus};
    use crate::resources::{Preparer, Task, TaskContext};
    use crate::transport::stub::RecordingSysCaller;
    use crate::transport::{ExecOutput, Invocation};
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn config() -> EngineConfig {
        EngineConfig {
            workers: 4,
            ..EngineConfig::default()
        }
    }

    fn engine(files: MemoryFetcher, sys: Arc<dyn SysCaller>) -> Engine {
        Engine::new(config())
            .with_fetcher(Arc::new(files))
            .with_sys(sys)
    }

    fn no_args() -> IndexMap<String, String> {
        IndexMap::new()
    }

    /// Sleeps briefly per script and records when it ran.
    #[derive(Default)]
    struct TimingSysCaller {
        spans: Mutex<Vec<(String, Instant, Instant)>>,
    }

    impl SysCaller for TimingSysCaller {
        fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ExecOutput> {
            cancel.check()?;
            let start = Instant::now();
            std::thread::sleep(Duration::from_millis(15));
            let end = Instant::now();
            self.spans
                .lock()
                .unwrap()
                .push((invocation.script.clone(), start, end));
            Ok(ExecOutput::default())
        }
    }

    #[test]
    fn test_cv020_plan_apply_replan() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a");
        let source = format!(
            "param \"filename\" {{ default = \"{}\" }}\nfile.content \"x\" {{ destination = \"{{{{param \\\"filename\\\"}}}}\"; content = \"hi\" }}\n",
            target.display()
        );
        let e = engine(
            MemoryFetcher::new().with("main.hcl", source),
            Arc::new(LocalSysCaller::new()),
        );
        let graph = e.load("main.hcl", &no_args()).unwrap();

        let planned = Summary::of(&e.plan(&graph).unwrap());
        assert_eq!(planned.changed, vec!["file.content.x"]);
        assert!(!target.exists());

        let applied = Summary::of(&e.apply(&graph).unwrap());
        assert!(applied.is_clean());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hi");

        let replanned = Summary::of(&e.plan(&graph).unwrap());
        assert!(!replanned.has_changes());
        assert!(replanned.unchanged.contains(&"file.content.x".to_string()));
    }

    #[test]
    fn test_cv020_dependency_order_and_skip() {
        let source = r#"
task "a" { apply = "write-a" }
task "b" {
  apply = "read-a"
  depends = ["task.a"]
}
"#;
        let timing = Arc::new(TimingSysCaller::default());
        let e = engine(MemoryFetcher::new().with("main.hcl", source), timing.clone());
        let graph = e.load("main.hcl", &no_args()).unwrap();
        for _ in 0..3 {
            e.apply(&graph).unwrap();
        }
        let spans = timing.spans.lock().unwrap().clone();
        assert_eq!(spans.len(), 6);
        for run in spans.chunks(2) {
            let (a, b) = (&run[0], &run[1]);
            assert_eq!((a.0.as_str(), b.0.as_str()), ("write-a", "read-a"));
            assert!(a.2 <= b.1);
        }

        let sys = Arc::new(RecordingSysCaller::new().on("write-a", ExecOutput::failed(1, "disk full")));
        let e = engine(MemoryFetcher::new().with("main.hcl", source), sys.clone());
        let applied = e.apply(&e.load("main.hcl", &no_args()).unwrap()).unwrap();
        let summary = Summary::of(&applied);
        assert_eq!(
            summary.failed,
            vec![("task.a".to_string(), "apply failed: apply exited 1: disk full".to_string())]
        );
        assert_eq!(summary.skipped, vec![("task.b".to_string(), "task.a".to_string())]);
        match &applied.get("root/task.b").unwrap().outcome().unwrap().stage {
            PipelineStage::Skipped(dep) => assert_eq!(dep.to_string(), "dependency task.a failed"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!sys.called("read-a"));
    }

    #[test]
    fn test_cv020_module_lookup() {
        let files = MemoryFetcher::new()
            .with(
                "main.hcl",
                r#"
module "./child.hcl" "m" {}
task "x" { apply = "echo {{lookup "module.m.t.output"}}" }
"#,
            )
            .with(
                "child.hcl",
                r#"task "t" {
  check = "probe-t"
  apply = "true"
}
"#,
            );
        let sys = Arc::new(RecordingSysCaller::new().on("probe-t", ExecOutput::ok("from-t\n")));
        let e = engine(files, sys);
        let graph = e.load("main.hcl", &no_args()).unwrap();
        assert!(graph.contains("root/module.m/task.t"));
        assert!(graph.has_edge("root", "root/module.m"));

        let planned = e.plan(&graph).unwrap();
        let exported = exports(&planned);
        assert_eq!(exported["root/module.m/task.t"]["output"], "from-t");
        assert_eq!(exported["root/task.x"]["apply"], "echo from-t");
    }

    #[test]
    fn test_cv020_cycle_runs_nothing() {
        let source = "task \"a\" {\n apply = \"a\"\n depends = [\"task.b\"]\n}\ntask \"b\" {\n apply = \"b\"\n depends = [\"task.a\"]\n}\n";
        let sys = Arc::new(RecordingSysCaller::new());
        let e = engine(MemoryFetcher::new().with("main.hcl", source), sys.clone());
        let err = e.load("main.hcl", &no_args()).unwrap_err();
        let Error::Cycle(cycles) = &err else {
            panic!("expected cycle, got {}", err);
        };
        assert_eq!(cycles[0], vec!["root/task.a", "root/task.b"]);
        assert_eq!(err.exit_code(), 2);
        assert!(sys.calls().is_empty());
    }

    #[test]
    fn test_cv020_package_rpm() {
        let source = "package.rpm \"nginx\" { state = \"present\" }\n";
        let sys = Arc::new(RecordingSysCaller::new().on("rpm -q nginx", ExecOutput::ok("nginx-1.24\n")));
        let e = engine(MemoryFetcher::new().with("main.hcl", source), sys.clone());
        let graph = e.load("main.hcl", &no_args()).unwrap();
        assert!(!Summary::of(&e.plan(&graph).unwrap()).has_changes());

        sys.set("rpm -q nginx", ExecOutput::failed(1, "package nginx is not installed"));
        assert_eq!(
            Summary::of(&e.plan(&graph).unwrap()).changed,
            vec!["package.rpm.nginx"]
        );
        let applied = Summary::of(&e.apply(&graph).unwrap());
        assert!(applied.is_clean());
        assert!(sys.called("yum install -y nginx"));
    }

    #[test]
    fn test_cv020_plans_are_deterministic() {
        let source = r#"
param "greeting" { default = "hi" }
task "a" { check = "probe-a"; apply = "echo {{param "greeting"}}" }
task "b" { check = "probe-b"; apply = "echo {{lookup "task.a.output"}}" }
task "c" { apply = "true"; depends = ["task.b"] }
"#;
        let sys = Arc::new(
            RecordingSysCaller::new()
                .on("probe-a", ExecOutput::failed(1, ""))
                .on("probe-b", ExecOutput::ok("b")),
        );
        let e = engine(MemoryFetcher::new().with("main.hcl", source), sys);
        let graph = e.load("main.hcl", &no_args()).unwrap();
        let first = e.plan(&graph).unwrap().to_jsonl().unwrap();
        let second = e.plan(&graph).unwrap().to_jsonl().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cv020_edges_order_execution() {
        let source = r#"
task "a" { apply = "a" }
task "b" { apply = "b"; depends = ["task.a"] }
task "c" { apply = "c"; depends = ["task.a"] }
task "d" { apply = "d"; depends = ["task.b", "task.c"] }
"#;
        let timing = Arc::new(TimingSysCaller::default());
        let e = engine(MemoryFetcher::new().with("main.hcl", source), timing.clone());
        let graph = e.load("main.hcl", &no_args()).unwrap();
        e.apply(&graph).unwrap();
        let spans = timing.spans.lock().unwrap().clone();
        let span = |name: &str| spans.iter().find(|s| s.0 == name).cloned().unwrap();
        for (from, to) in [("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")] {
            assert!(span(to).2 <= span(from).1, "{} started before {} ended", from, to);
        }
    }

    #[test]
    fn test_cv020_failure_skips_transitive_dependents() {
        let source = r#"
task "a" { apply = "fail-a" }
task "b" { apply = "run-b"; depends = ["task.a"] }
task "c" { apply = "run-c"; depends = ["task.b"] }
task "d" { apply = "run-d" }
"#;
        let sys = Arc::new(RecordingSysCaller::new().on("fail-a", ExecOutput::failed(3, "")));
        let e = engine(MemoryFetcher::new().with("main.hcl", source), sys.clone());
        let summary = Summary::of(&e.apply(&e.load("main.hcl", &no_args()).unwrap()).unwrap());
        assert_eq!(
            summary.skipped,
            vec![
                ("task.b".to_string(), "task.a".to_string()),
                ("task.c".to_string(), "task.a".to_string()),
            ]
        );
        assert!(!sys.called("run-b"));
        assert!(!sys.called("run-c"));
        assert!(sys.called("run-d"));
        assert!(!summary.is_clean());
    }

    #[test]
    fn test_cv020_remote_signature_enforced() {
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/keystore");
        let read = |name: &str| std::fs::read(fixtures.join(name)).unwrap();
        let keys = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.keystore.system = keys.path().join("system");
        cfg.keystore.user = keys.path().join("user");
        cfg.keystore.local = keys.path().join("local");

        let url = "https://modules.example/motd.hcl";
        let forged = MemoryFetcher::new()
            .with(url, read("module.hcl"))
            .with(&format!("{}.sig", url), read("module.hcl.other.sig"));
        let e = Engine::new(cfg.clone()).with_fetcher(Arc::new(forged));
        e.keystore().store_trusted_key(&read("release.asc")).unwrap();
        let err = e.load(url, &no_args()).unwrap_err();
        assert!(matches!(err, Error::Signature(_)), "{}", err);
        assert!(err.to_string().contains("no valid signatures found"));

        let signed = MemoryFetcher::new()
            .with(url, read("module.hcl"))
            .with(&format!("{}.sig", url), read("module.hcl.sig"));
        let e = Engine::new(cfg).with_fetcher(Arc::new(signed));
        let graph = e.load(url, &no_args()).unwrap();
        assert!(graph.contains("root/file.content.motd"));
    }

    #[test]
    fn test_cv020_required_param_fails_dependents() {
        let source = "param \"who\" {}\ntask \"greet\" { apply = \"echo {{param \\\"who\\\"}}\" }\n";
        let sys = Arc::new(RecordingSysCaller::new());
        let e = engine(MemoryFetcher::new().with("main.hcl", source), sys.clone());
        let graph = e.load("main.hcl", &no_args()).unwrap();
        let summary = Summary::of(&e.plan(&graph).unwrap());
        assert_eq!(
            summary.failed,
            vec![("param.who".to_string(), "param \"who\" is required".to_string())]
        );
        assert_eq!(summary.skipped, vec![("task.greet".to_string(), "param.who".to_string())]);

        let mut args = IndexMap::new();
        args.insert("who".to_string(), "world".to_string());
        let graph = e.load("main.hcl", &args).unwrap();
        let applied = e.apply(&graph).unwrap();
        assert!(Summary::of(&applied).is_clean());
        assert!(sys.called("echo world"));
    }

    #[test]
    fn test_cv020_module_arguments_render_in_caller_scope() {
        let files = MemoryFetcher::new()
            .with(
                "main.hcl",
                r#"
param "port" { default = 8080 }
module "./web.hcl" "web" { listen = "0.0.0.0:{{param "port"}}" }
"#,
            )
            .with(
                "web.hcl",
                r#"
param "listen" {}
task "serve" { apply = "serve {{param "listen"}}" }
"#,
            );
        let sys = Arc::new(RecordingSysCaller::new());
        let e = engine(files, sys.clone());
        let graph = e.load("main.hcl", &no_args()).unwrap();
        assert!(graph.has_edge("root/module.web/param.listen", "root/param.port"));
        e.apply(&graph).unwrap();
        assert_eq!(sys.calls(), vec!["serve 0.0.0.0:8080"]);
    }

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct PanicPreparer {}

    struct PanicTask;

    impl Preparer for PanicPreparer {
        fn prepare(&self, _ctx: &TaskContext, _renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
            Ok(Arc::new(PanicTask))
        }
    }

    impl Task for PanicTask {
        fn check(&self, _ctx: &TaskContext, _renderer: &Renderer<'_>) -> Result<TaskStatus> {
            panic!("driver bug")
        }

        fn apply(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
            Ok(TaskStatus::no_change("unreachable"))
        }

        fn exports(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    #[test]
    fn test_cv020_driver_panic_is_a_check_error() {
        let registry = Registry::builder()
            .register::<PanicPreparer>("test.panic")
            .register::<crate::resources::shell::ShellPreparer>("task")
            .build();
        let source = "test.panic \"p\" {}\ntask \"after\" {\n apply = \"x\"\n depends = [\"test.panic.p\"]\n}\n";
        let e = engine(
            MemoryFetcher::new().with("main.hcl", source),
            Arc::new(RecordingSysCaller::new()),
        )
        .with_registry(registry);
        let graph = e.load("main.hcl", &no_args()).unwrap();
        let summary = Summary::of(&e.plan(&graph).unwrap());
        assert_eq!(
            summary.failed,
            vec![(
                "test.panic.p".to_string(),
                "check failed: test.panic driver panicked: driver bug".to_string()
            )]
        );
        assert_eq!(summary.skipped.len(), 1);
    }

    #[test]
    fn test_cv020_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let e = engine(
            MemoryFetcher::new().with("main.hcl", "task \"a\" { apply = \"a\" }\n"),
            Arc::new(RecordingSysCaller::new()),
        )
        .with_cancel(cancel);
        let graph = e.load("main.hcl", &no_args()).unwrap();
        let err = e.apply(&graph).unwrap_err();
        assert_eq!(err.exit_code(), 130);
    }

    #[test]
    fn test_cv020_healthcheck_after_plan() {
        let source = r#"
task "ok" { check = "probe-ok"; apply = "true" }
task "pending" { apply = "true" }
"#;
        let e = engine(
            MemoryFetcher::new().with("main.hcl", source),
            Arc::new(RecordingSysCaller::new()),
        );
        let graph = e.load("main.hcl", &no_args()).unwrap();
        let health = e.healthcheck(&e.plan(&graph).unwrap()).unwrap();
        let shown = health::displayed(&health);
        let names: Vec<&str> = shown.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["task.pending"]);
        assert_eq!(health::overall(&health), HealthLevel::Warning);

        let applied = e.apply(&graph).unwrap();
        let health = e.healthcheck(&applied).unwrap();
        assert_eq!(health::overall(&health), HealthLevel::Healthy);
    }
}
