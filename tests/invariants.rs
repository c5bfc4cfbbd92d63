//! Contract Invariant Tests
//!
//! These tests verify the guarantees hosts rely on.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::fs;
use std::sync::{Arc, RwLock};

use forgeviews_core::{
    Dictionary, Engine, EngineConfig, FileStore, MemoryStore, SourceError, TemplateRegistry, ViewError,
};

fn data(value: Value) -> Dictionary {
    match value {
        Value::Object(map) => map,
        other => panic!("data must be an object, got {}", other),
    }
}

fn engine_with(views: &[(&str, &str)], config: EngineConfig) -> Engine {
    let mut registry = TemplateRegistry::new();
    for (view, text) in views {
        registry.register(view, *text);
    }
    Engine::with_loader(config, registry, Box::new(MemoryStore::new()))
}

fn engine(views: &[(&str, &str)]) -> Engine {
    engine_with(views, EngineConfig::default())
}

fn shared_engine(config: EngineConfig) -> (Arc<RwLock<TemplateRegistry>>, Engine) {
    let registry = Arc::new(RwLock::new(TemplateRegistry::new()));
    let engine = Engine::with_loader(config, Arc::clone(&registry), Box::new(MemoryStore::new()));
    (registry, engine)
}

// --- Scenarios ---

#[test]
fn scenario_simple_output() {
    let engine = engine(&[("hello", "Hello {{ $name }}")]);
    let html = engine.render("hello", data(json!({"name": "World"}))).unwrap();
    assert_eq!(html, "Hello World");
}

#[test]
fn scenario_layout_inheritance() {
    let engine = engine(&[
        ("child", "{% extends \"layout\" %}{% block main %}Body{% end block %}"),
        ("layout", "Header {% content main %} Footer"),
    ]);
    assert_eq!(engine.render("child", Dictionary::new()).unwrap(), "Header Body Footer");
}

#[test]
fn scenario_foreach() {
    let engine = engine(&[("list", "{% foreach($items as $item) %}{{ $item }},{% endforeach %}")]);
    let html = engine.render("list", data(json!({"items": [1, 2, 3]}))).unwrap();
    assert_eq!(html, "1,2,3,");
}

#[test]
fn scenario_subview_with_argument() {
    let engine = engine(&[
        ("page", "{% render \"widget\" $x => 5 %}"),
        ("widget", "Value: {{ $x }}"),
    ]);
    assert_eq!(engine.render("page", Dictionary::new()).unwrap(), "Value: 5");
}

#[test]
fn scenario_debug_fault_maps_to_source() {
    let text = "<h1>Broken</h1>\n<p>\n{{ $missing }}\n</p>";
    let engine = engine_with(&[("broken", text)], EngineConfig::default().with_debug(true));

    let err = engine.render("broken", data(json!({"title": "x"}))).unwrap_err();
    let exception = err.exception().expect("debug mode maps faults");
    assert_eq!(exception.line, 3);
    assert_eq!(exception.view, "broken");
    assert_eq!(exception.original, text);
    assert_eq!(exception.data.get("title"), Some(&json!("x")));
}

#[test]
fn scenario_missing_view_exists_is_false() {
    let engine = engine(&[]);
    assert!(!engine.view_exists("missing"));
}

// --- Compilation ---

#[test]
fn invariant_compilation_is_deterministic() {
    let text = "{% extends layout %}{% block a %}{% if($x) %}{{ $x }}{% endif %}{% end block %}";
    let first = engine(&[("page", text), ("layout", "{% content a %}")]).compile("page").unwrap();
    let second = engine(&[("page", text), ("layout", "{% content a %}")]).compile("page").unwrap();
    assert_eq!(first.len(), 2);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.as_ref(), b.as_ref());
        assert_eq!(a.blocks, b.blocks);
    }
}

#[test]
fn invariant_literal_text_passes_through() {
    let text = "<div class=\"x\">{ not a tag } 100% {%no close\n\t</div>";
    let engine = engine(&[("static", text)]);
    assert_eq!(engine.render("static", Dictionary::new()).unwrap(), text);
}

#[test]
fn invariant_nearest_descendant_block_at_any_depth() {
    let engine = engine(&[
        ("base", "{% content title %}|{% content body %}|{% content footer %}"),
        ("section", "{% extends base %}{% block title %}Section{% end block %}{% block body %}section body{% end block %}"),
        ("article", "{% extends section %}{% block body %}article body{% end block %}"),
        ("page", "{% extends article %}{% block title %}Page{% end block %}"),
    ]);
    assert_eq!(
        engine.render("page", Dictionary::new()).unwrap(),
        "Page|article body|"
    );
}

#[test]
fn invariant_subview_argument_forms() {
    let engine = engine(&[
        (
            "page",
            "{% render card $count => 1 + 1, $user->name as $author, $title %}",
        ),
        (
            "card",
            "{{ json_encode([$count, $author, $title, $other, $user->name]) }}",
        ),
    ]);
    let html = engine
        .render(
            "page",
            data(json!({"title": "T", "other": "kept", "user": {"name": "Ada"}})),
        )
        .unwrap();
    assert_eq!(html, r#"[2,"Ada","T","kept","Ada"]"#);
}

#[test]
fn invariant_explicit_binding_overrides_caller_entry() {
    let engine = engine(&[
        ("page", "{% render card $title => 'bound', $title => 'last' %}{{ $title }}"),
        ("card", "{{ $title }}|"),
    ]);
    let html = engine.render("page", data(json!({"title": "caller"}))).unwrap();
    assert_eq!(html, "last|caller");
}

#[test]
fn invariant_bare_argument_without_caller_value_faults() {
    let engine = engine(&[("page", "{% render card $absent %}"), ("card", "{{ $absent ?? 'unset' }}")]);
    let err = engine.render("page", Dictionary::new()).unwrap_err();
    assert!(err.is_execution_fault(), "got {:?}", err);
    assert!(err.to_string().contains("absent"));

    let html = engine.render("page", data(json!({"absent": "here"}))).unwrap();
    assert_eq!(html, "here");
}

#[test]
fn invariant_circular_content_fails_fast() {
    let engine = engine(&[
        ("child", "{% extends layout %}{% block main %}x{% content main %}{% end block %}"),
        ("layout", "[{% content main %}]"),
    ]);
    let err = engine.render("child", Dictionary::new()).unwrap_err();
    assert!(matches!(err, ViewError::CircularContent(_)), "got {:?}", err);
}

// --- Cache ---

#[test]
fn invariant_content_change_invalidates_cache() {
    let (registry, engine) = shared_engine(EngineConfig::default());
    registry.write().unwrap().register("page", "v1");

    assert_eq!(engine.render("page", Dictionary::new()).unwrap(), "v1");
    assert_eq!(engine.render("page", Dictionary::new()).unwrap(), "v1");
    assert_eq!(engine.cache_stats().hits, 1);

    registry.write().unwrap().register("page", "v2");
    assert_eq!(engine.render("page", Dictionary::new()).unwrap(), "v2");
    assert_eq!(engine.cache_stats().misses, 2);
}

#[test]
fn invariant_mtime_change_invalidates_cache() {
    let (registry, engine) = shared_engine(EngineConfig::default());
    let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

    registry.write().unwrap().register_at("page", "same", t1);
    engine.render("page", Dictionary::new()).unwrap();
    registry.write().unwrap().register_at("page", "same", t2);
    engine.render("page", Dictionary::new()).unwrap();

    assert_eq!(engine.cache_stats().misses, 2);
    assert_eq!(engine.cache_stats().hits, 0);
}

#[test]
fn invariant_included_file_change_invalidates_cache() {
    let (registry, engine) = shared_engine(EngineConfig::default());
    {
        let mut registry = registry.write().unwrap();
        registry.register("page", "<{% include partials/nav %}>");
        registry.register("partials/nav", "old");
    }
    assert_eq!(engine.render("page", Dictionary::new()).unwrap(), "<old>");

    registry.write().unwrap().register("partials/nav", "new");
    assert_eq!(engine.render("page", Dictionary::new()).unwrap(), "<new>");
}

#[test]
fn invariant_prune_removes_only_stale_entries() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(RwLock::new(TemplateRegistry::new()));
    let engine = Engine::with_loader(
        EngineConfig::default(),
        Arc::clone(&registry),
        Box::new(FileStore::new(dir.path()).unwrap()),
    );

    registry.write().unwrap().register("page", "{% block a %}one{% end block %}");
    engine.compile("page").unwrap();
    registry.write().unwrap().register("page", "{% block a %}two{% end block %}");
    engine.compile("page").unwrap();
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 4);

    assert_eq!(engine.prune_cache("page").unwrap(), 2);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    assert_eq!(engine.prune_cache("page").unwrap(), 0);
}

#[test]
fn invariant_file_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let views = dir.path().join("views");
    fs::create_dir_all(&views).unwrap();
    fs::write(views.join("layout.html"), "[{% content body %}]").unwrap();
    fs::write(views.join("page.html"), "{% extends layout %}{% block body %}{{ $n * 2 }}{% end block %}").unwrap();

    let config = EngineConfig::new(&views).with_cache_dir(dir.path().join("cache"));
    let first = Engine::new(config.clone()).unwrap();
    assert_eq!(first.render("page", data(json!({"n": 21}))).unwrap(), "[42]");

    let second = Engine::new(config).unwrap();
    assert_eq!(second.render("page", data(json!({"n": 4}))).unwrap(), "[8]");
    assert_eq!(second.cache_stats().hits, 2);
    assert_eq!(second.cache_stats().misses, 0);
}

// --- Debug mapping ---

#[test]
fn invariant_block_fault_reports_source_line() {
    // Block opens on line 3, fault 3 lines into its body
    let child = "{% extends layout %}\n\n{% block main %}\n<p>ok</p>\n{{ $post->title }}\n{% end block %}";
    let engine = engine_with(
        &[("child", child), ("layout", "<main>\n{% content main %}\n</main>")],
        EngineConfig::default().with_debug(true),
    );

    let err = engine.render("child", data(json!({"post": null}))).unwrap_err();
    let exception = err.exception().expect("mapped");
    assert_eq!(exception.view, "child");
    assert_eq!(exception.line, 5);
    assert_eq!(exception.original, child);
}

#[test]
fn invariant_subview_fault_maps_to_subview() {
    let engine = engine_with(
        &[("page", "a\nb\n{% render widget %}"), ("widget", "\n{{ 1 / 0 }}")],
        EngineConfig::default().with_debug(true),
    );
    let err = engine.render("page", Dictionary::new()).unwrap_err();
    let exception = err.exception().expect("mapped");
    assert_eq!(exception.view, "widget");
    assert_eq!(exception.line, 2);
}

#[test]
fn invariant_production_faults_carry_no_source() {
    let engine = engine(&[("page", "{% foreach($n as $x) %}{% endforeach %}")]);
    let err = engine.render("page", data(json!({"n": 3, "secret": "pw"}))).unwrap_err();
    assert!(err.exception().is_none());
    match err {
        ViewError::Fault(fault) => {
            assert!(fault.data.is_none());
            assert!(!fault.to_string().contains("pw"));
        }
        other => panic!("expected raw fault, got {:?}", other),
    }
}

#[test]
fn invariant_malformed_control_tag_faults_at_execution() {
    let engine = engine(&[("page", "before {% if($x) %} never closed")]);
    let err = engine.render("page", data(json!({"x": true}))).unwrap_err();
    assert!(err.is_execution_fault());
}

// --- Reference errors ---

#[test]
fn invariant_missing_targets_are_reference_errors() {
    let engine = engine_with(
        &[
            ("a", "{% extends ghost %}"),
            ("b", "{% include ghost %}"),
            ("c", "{% render ghost %}"),
        ],
        EngineConfig::default().with_debug(true),
    );
    for view in ["a", "b", "c"] {
        let err = engine.render(view, Dictionary::new()).unwrap_err();
        assert!(
            matches!(&err, ViewError::Source(SourceError::ViewNotFound(v)) if v == "ghost"),
            "{} gave {:?}",
            view,
            err
        );
    }
}

#[test]
fn invariant_cycles_fail_fast() {
    let engine = engine(&[
        ("a", "{% extends b %}"),
        ("b", "{% extends a %}"),
        ("loop", "{% include loop %}"),
        ("recur", "{% render recur %}"),
    ]);
    assert!(matches!(engine.render("a", Dictionary::new()), Err(ViewError::CircularExtends(_))));
    assert!(matches!(engine.render("loop", Dictionary::new()), Err(ViewError::Compile(_))));
    assert!(matches!(
        engine.render("recur", Dictionary::new()),
        Err(ViewError::RenderDepthExceeded { .. })
    ));
}

// --- Reserved keys ---

#[test]
fn invariant_reserved_keys() {
    let mut context = Dictionary::new();
    context.insert("site".into(), json!("Demo"));
    let engine = engine_with(
        &[
            ("page", "{{ $view }} {{ $context['site'] }} {% render part %}"),
            ("part", "{{ $view }} {{ $context['site'] }}"),
        ],
        EngineConfig::default().with_context(context),
    );

    assert_eq!(engine.render("page", Dictionary::new()).unwrap(), "page Demo part Demo");

    let html = engine
        .render("page", data(json!({"view": "spoof", "context": {"site": "Override"}})))
        .unwrap();
    assert_eq!(html, "page Override part Override");
}
