use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use qtl_conf::Settings;
use qtl_conf::CACHE_PROFILE_NAME;
use qtl_engine::builtins::WRAPPED_BUILDER_NAME;
use qtl_engine::CompiledArtifact;
use qtl_engine::EngineError;
use qtl_engine::InMemoryTemplateProvider;
use qtl_engine::RenderOptions;
use qtl_engine::TemplateEngine;
use qtl_query::DataColumn;
use qtl_query::DataResult;
use qtl_query::DataSource;
use qtl_query::Direction;
use qtl_query::ExecuteOptions;
use qtl_query::OrderBy;
use qtl_query::Pagination;
use qtl_query::QueryExecutor;
use qtl_query::RequestParameter;
use qtl_query::Row;
use qtl_templates::Node;
use serde_json::json;
use serde_json::Map;

#[derive(Default)]
struct RecordingDataSource {
    executed: Mutex<Vec<ExecuteOptions>>,
}

impl RecordingDataSource {
    fn executed(&self) -> Vec<ExecuteOptions> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataSource for RecordingDataSource {
    async fn execute(&self, options: ExecuteOptions) -> anyhow::Result<DataResult> {
        self.executed.lock().unwrap().push(options);
        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        Ok(DataResult::from_rows(
            vec![DataColumn::new("id", "integer")],
            vec![row],
        ))
    }

    async fn prepare(&self, parameter: RequestParameter) -> anyhow::Result<String> {
        Ok(format!("${}", parameter.parameter_index))
    }
}

struct Fixture {
    source: Arc<RecordingDataSource>,
    cache: Arc<RecordingDataSource>,
    engine: TemplateEngine,
}

fn fixture(provider: InMemoryTemplateProvider) -> Fixture {
    let source = Arc::new(RecordingDataSource::default());
    let cache = Arc::new(RecordingDataSource::default());
    let executor = QueryExecutor::new()
        .with_source("pg", Arc::clone(&source) as Arc<dyn DataSource>)
        .with_source(CACHE_PROFILE_NAME, Arc::clone(&cache) as Arc<dyn DataSource>);
    let engine =
        TemplateEngine::with_builtins(Arc::new(executor), Arc::new(provider), &Settings::default())
            .unwrap();
    Fixture {
        source,
        cache,
        engine,
    }
}

fn single(name: &str, statement: &str) -> Fixture {
    fixture(InMemoryTemplateProvider::new().with_template(name, statement))
}

fn options(parameters: serde_json::Value) -> RenderOptions {
    let parameters: Map<String, serde_json::Value> = match parameters {
        serde_json::Value::Object(map) => map,
        _ => Map::new(),
    };
    RenderOptions {
        parameters,
        profile_name: Some("pg".to_string()),
        ..RenderOptions::default()
    }
}

#[tokio::test]
async fn test_plain_template_becomes_main_builder() {
    let fixture = single("users", "select * from users\n\n-- trailing comment\n");
    let builder = fixture
        .engine
        .render_builder("users", options(json!({})))
        .await
        .unwrap();
    assert_eq!(builder.statement(), "select * from users\n");
    assert_eq!(builder.profile_name(), "pg");
}

#[tokio::test]
async fn test_empty_template_still_gets_a_main_builder() {
    let fixture = single("empty", "");
    let artifact = fixture.engine.compile().unwrap();
    let Node::Root { children, .. } = &artifact.templates["empty"] else {
        panic!("expected root");
    };
    assert_eq!(children.len(), 1);
    let Node::ExtensionCall {
        extension, args, ..
    } = &children[0]
    else {
        panic!("expected implicit req, got {:?}", children[0]);
    };
    assert_eq!(extension, "req");
    assert_eq!(args[0].as_str_literal(), Some(WRAPPED_BUILDER_NAME));
    assert_eq!(args[1].as_literal(), Some(&json!(true)));

    let rows = fixture
        .engine
        .render("empty", options(json!({})), None)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let executed = fixture.source.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].statement, "");
    assert_eq!(executed[0].profile_name, "pg");
    assert!(executed[0].bind_params.is_empty());
}

#[tokio::test]
async fn test_parameters_are_bound_not_inlined() {
    let fixture = single("users", "select * from users where id = {{ params.id }}");
    let rows = fixture
        .engine
        .render("users", options(json!({"id": "1 OR 1=1"})), None)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let executed = fixture.source.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].statement, "select * from users where id = $1");
    assert_eq!(executed[0].bind_params["$1"], json!("1 OR 1=1"));
}

#[tokio::test]
async fn test_missing_profile_is_internal() {
    let fixture = single("users", "select 1");
    let err = fixture
        .engine
        .render_builder("users", RenderOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Internal(ref message) if message == "No profile name found"));
    assert_eq!(err.public_message(), "An internal error occurred");
}

#[tokio::test]
async fn test_error_tag_raises_user_error_at_tag() {
    let fixture = single("users", "select 1\n{% error 'NOT_FOUND' %}");
    let err = fixture
        .engine
        .render_builder("users", options(json!({})))
        .await
        .unwrap_err();
    match err {
        EngineError::User {
            message, location, ..
        } => {
            assert_eq!(message, "NOT_FOUND");
            let location = location.unwrap();
            assert_eq!((location.line, location.column), (2, 4));
        }
        other => panic!("expected user error, got {other:?}"),
    }
    assert!(fixture.source.executed().is_empty());
}

#[test]
fn test_two_main_builders_fail_to_compile() {
    let fixture = single(
        "users",
        "{% req a main %}select 1{% endreq %}{% req b main %}select 2{% endreq %}",
    );
    let err = fixture.engine.compile().unwrap_err();
    assert!(
        matches!(err, EngineError::Internal(ref message) if message == "Only one main builder is allowed.")
    );
}

#[test]
fn test_unknown_filter_fails_to_compile() {
    let fixture = single("users", "select {{ params.id | shout }}");
    let err = fixture.engine.compile().unwrap_err();
    assert!(matches!(err, EngineError::Syntax(_)));
    assert!(err.to_string().starts_with("filter not found: shout"));
}

#[tokio::test]
async fn test_builder_operations_accumulate() {
    let fixture = single(
        "users",
        "{% req user main %}select * from users{% endreq %}\
         {% set grouped = user.groupBy('a') %}\
         {% set grouped = user.groupBy('b') %}\
         {% set ordered = user.orderBy('x') %}\
         {% set ordered = user.orderBy('y', 'desc') %}",
    );
    fixture
        .engine
        .render(
            "users",
            options(json!({})),
            Some(Pagination {
                limit: Some(10),
                offset: None,
            }),
        )
        .await
        .unwrap();

    let executed = fixture.source.executed();
    assert_eq!(executed[0].statement, "select * from users");
    assert_eq!(executed[0].operations.group_by, vec!["a", "b"]);
    assert_eq!(
        executed[0].operations.order_by,
        vec![
            OrderBy {
                column: "x".to_string(),
                direction: Direction::Asc,
            },
            OrderBy {
                column: "y".to_string(),
                direction: Direction::Desc,
            },
        ]
    );
    assert_eq!(executed[0].operations.limit.as_deref(), Some("$1"));
    assert_eq!(executed[0].bind_params["$1"], json!(10));
}

#[tokio::test]
async fn test_masking_binds_its_arguments() {
    let fixture = single("users", "select {% masking id partial(2, 'xxx', 3) %} from users");
    let builder = fixture
        .engine
        .render_builder("users", options(json!({})))
        .await
        .unwrap();
    assert_eq!(
        builder.statement(),
        "select CASE WHEN (length(id) > 5) THEN concat(substr(id, 1, $1), $2, substr(id, length(id) - 2, $3)) ELSE $2 END from users"
    );
    let binding = builder.parameterizer().binding();
    assert_eq!(binding["$1"], json!(2));
    assert_eq!(binding["$2"], json!("xxx"));
    assert_eq!(binding["$3"], json!(3));
}

#[tokio::test]
async fn test_cache_tag_replaces_main_builder() {
    let fixture = single(
        "users",
        "{% cache %}select * from cached_users{% endcache %}select * from users",
    );
    fixture
        .engine
        .render("users", options(json!({})), None)
        .await
        .unwrap();

    assert!(fixture.source.executed().is_empty());
    let executed = fixture.cache.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].statement, "set schema=qtl;\nselect * from cached_users");
    assert_eq!(executed[0].profile_name, CACHE_PROFILE_NAME);
    assert_eq!(fixture.engine.metadata("users").unwrap()["cache"], json!(true));
}

#[tokio::test]
async fn test_builder_value_runs_the_dependency_first() {
    let fixture = single(
        "users",
        "{% req user %}select * from users{% endreq %}\
         {% req result main %}select * from orders where user_id = {{ user.value()[0].id }}{% endreq %}",
    );
    fixture
        .engine
        .render("users", options(json!({})), None)
        .await
        .unwrap();

    let executed = fixture.source.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].statement, "select * from users");
    assert_eq!(executed[1].statement, "select * from orders where user_id = $1");
    assert_eq!(executed[1].bind_params["$1"], json!(1));
}

#[tokio::test]
async fn test_raw_and_void_filters() {
    let fixture = single(
        "users",
        "select {{ [1, 1, 2] | unique | join(',') | raw }}{{ 'x' | void }}",
    );
    let builder = fixture
        .engine
        .render_builder("users", options(json!({})))
        .await
        .unwrap();
    assert_eq!(builder.statement(), "select 1,2");
    assert!(builder.parameterizer().binding().is_empty());
}

#[tokio::test]
async fn test_validator_metadata_and_failure() {
    let fixture = single(
        "users",
        "select * from users where id = {{ params.id | is_required }}",
    );
    let metadata = fixture.engine.metadata("users").unwrap();
    let parameters = &metadata["parameters"];
    assert_eq!(parameters[0]["name"], json!("id"));
    assert_eq!(parameters[0]["validators"][0]["name"], json!("required"));

    fixture
        .engine
        .render("users", options(json!({"id": 7})), None)
        .await
        .unwrap();
    assert_eq!(fixture.source.executed()[0].bind_params["$1"], json!(7));

    let err = fixture
        .engine
        .render("users", options(json!({})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::User { .. }));
}

#[tokio::test]
async fn test_loaded_artifact_renders_without_sources() {
    let compiler = single("users", "select * from users where id = {{ params.id }}");
    let artifact = compiler.engine.compile().unwrap();
    assert_eq!(artifact.templates.keys().collect::<Vec<_>>(), vec!["users"]);

    let json = serde_json::to_string(&artifact).unwrap();
    let artifact: CompiledArtifact = serde_json::from_str(&json).unwrap();

    let runner = fixture(InMemoryTemplateProvider::new());
    runner.engine.load(artifact);
    let builder = runner
        .engine
        .render_builder("users", options(json!({"id": 3})))
        .await
        .unwrap();
    assert_eq!(builder.statement(), "select * from users where id = $1");
    assert!(matches!(
        runner.engine.render_builder("other", options(json!({}))).await,
        Err(EngineError::TemplateNotFound(_))
    ));
}
