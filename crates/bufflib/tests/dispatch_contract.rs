//! `dispatch_contract` 集成测试：验证 `s_` 成员的委派、缓存与并发安装。
//!
//! # 结构安排（How）
//! - 预装与惰性两种模式各覆盖一次；
//! - 模块打开后才注册到 string 库的函数，应在首次查找时被解析；
//! - 多线程同时查找同一名字时只安装一个适配器。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use bufflib::{BuffConfig, BuffLib, StringLibrary, StringTable, Value, codes};

fn lazy_config() -> BuffConfig {
    BuffConfig::default().with_eager_delegation(false)
}

#[test]
fn method_and_library_syntax_reach_the_same_adapter() {
    let lib = BuffLib::open(Some(StringTable::standard().shared()));
    let buffer = lib.new_buffer(&[Value::from("Hello")]).expect("创建缓冲");

    let by_method = lib.invoke(&buffer, "s_upper", &[]).expect("方法调用");
    let by_library = lib
        .call("s_upper", &[Value::Buffer(buffer.clone())])
        .expect("库调用");
    assert_eq!(by_method, vec![Value::from("HELLO")]);
    assert_eq!(by_method, by_library);

    let in_meta = lib.metatable().get("s_upper").expect("元表");
    let in_module = lib.get_field("s_upper").expect("模块表");
    assert!(
        in_meta
            .as_function()
            .expect("函数")
            .ptr_eq(in_module.as_function().expect("函数"))
    );
}

#[test]
fn extra_arguments_are_forwarded_and_results_returned_verbatim() {
    let lib = BuffLib::open(Some(StringTable::standard().shared()));
    let buffer = lib.new_buffer(&[Value::from("a.b.c")]).expect("创建缓冲");

    let found = lib
        .invoke(&buffer, "s_find", &[Value::from(".c")])
        .expect("find");
    assert_eq!(found, vec![Value::Integer(4), Value::Integer(5)]);

    let bytes = lib
        .invoke(&buffer, "s_byte", &[Value::Integer(1), Value::Integer(3)])
        .expect("byte");
    assert_eq!(bytes.len(), 3);
    assert_eq!(buffer.materialize().as_ref(), b"a.b.c");
}

#[test]
fn functions_registered_after_open_resolve_lazily() {
    let table = Arc::new(StringTable::standard());
    let library: Arc<dyn StringLibrary> = table.clone();
    let lib = BuffLib::open(Some(library));
    assert!(lib.index("s_shout").is_none());
    assert!(!lib.metatable().contains("s_shout"));

    table.register("shout", |args| {
        let mut text = args[0].to_display().to_ascii_uppercase();
        text.push(b'!');
        Ok(vec![Value::from(text)])
    });

    let buffer = lib.new_buffer(&[Value::from("hey")]).expect("创建缓冲");
    let out = lib.invoke(&buffer, "s_shout", &[]).expect("惰性解析");
    assert_eq!(out, vec![Value::from("HEY!")]);
    assert!(lib.get_field("s_shout").is_some());
}

#[test]
fn lazy_mode_keeps_module_table_clean_until_first_use() {
    let lib = BuffLib::open_with(lazy_config(), Some(StringTable::standard().shared()))
        .expect("配置有效");
    let names = lib.module_table().names();
    assert!(names.iter().all(|name| !name.starts_with("s_")), "{names:?}");

    let err = lib
        .call("s_len", &[Value::Buffer(lib.new_buffer(&[]).expect("缓冲"))])
        .expect_err("库调用不会触发惰性解析");
    assert_eq!(err.code(), codes::NOT_CALLABLE);

    assert!(lib.index("s_len").is_some());
    assert!(lib.get_field("s_len").is_some());
}

#[test]
fn unknown_members_are_neither_installed_nor_callable() {
    let lib = BuffLib::open(Some(StringTable::standard().shared()));
    let buffer = lib.new_buffer(&[]).expect("创建缓冲");
    let before = lib.metatable().len();

    for name in ["s_nothing", "upper", "s_"] {
        let err = lib.invoke(&buffer, name, &[]).expect_err("不存在的成员");
        assert_eq!(err.code(), codes::NOT_CALLABLE, "{name}");
    }
    assert_eq!(lib.metatable().len(), before);
}

#[test]
fn concurrent_lookups_install_one_adapter() {
    let calls = Arc::new(AtomicUsize::new(0));
    let table = StringTable::new();
    let counter = calls.clone();
    table.register("count", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    });
    let lib = Arc::new(
        BuffLib::open_with(lazy_config(), Some(table.shared())).expect("配置有效"),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lib = lib.clone();
            thread::spawn(move || lib.index("s_count").expect("应解析出适配器"))
        })
        .collect();
    let adapters: Vec<Value> = handles
        .into_iter()
        .map(|handle| handle.join().expect("线程不应 panic"))
        .collect();

    let first = adapters[0].as_function().expect("函数");
    for adapter in &adapters[1..] {
        assert!(first.ptr_eq(adapter.as_function().expect("函数")));
    }
    assert_eq!(
        lib.module_table()
            .names()
            .iter()
            .filter(|name| name.as_str() == "s_count")
            .count(),
        1
    );

    let buffer = lib.new_buffer(&[]).expect("创建缓冲");
    lib.invoke(&buffer, "s_count", &[]).expect("调用");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_eager_installs_count_each_adapter_once() {
    let table = StringTable::standard().shared();
    let expected = table
        .entries()
        .into_iter()
        .filter(|(_, value)| value.as_function().is_some())
        .count();
    let lib = Arc::new(BuffLib::open_with(lazy_config(), Some(table)).expect("配置有效"));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lib = lib.clone();
            thread::spawn(move || lib.dispatch().install_all())
        })
        .collect();
    let installed: usize = handles
        .into_iter()
        .map(|handle| handle.join().expect("线程不应 panic"))
        .sum();

    assert_eq!(installed, expected);
    assert_eq!(lib.dispatch().install_all(), 0);
}

#[test]
fn external_failures_propagate_unchanged() {
    let lib = BuffLib::open(Some(StringTable::standard().shared()));
    let buffer = lib.new_buffer(&[Value::from("x")]).expect("创建缓冲");
    let err = lib
        .invoke(&buffer, "s_rep", &[Value::from("many")])
        .expect_err("rep 需要数字");
    assert_eq!(
        err.to_string(),
        "bad argument #2 to 'rep' (number expected, got string)"
    );
}
