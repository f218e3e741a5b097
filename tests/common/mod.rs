//! Shared fixtures: an identity supplier with per-function call counting.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use supplygraph::{
    DefaultSupplier, Field, FnPlugin, Node, NodeSpec, Param, ParamOnError, Supplier,
    SupplyError, SupplyResponse, ValueType, VarParamSpec,
};

pub type Counts = Mutex<HashMap<String, usize>>;

pub fn new_counts() -> Arc<Counts> {
    Arc::new(Mutex::new(HashMap::new()))
}

pub fn calls(counts: &Counts, func: &str) -> usize {
    counts.lock().unwrap().get(func).copied().unwrap_or(0)
}

/// Identity plugin: every declared field gets the first argument (or `"x"`
/// when the function takes none), and each invocation is counted.
pub fn register_identity(
    supplier: &DefaultSupplier,
    func: &str,
    fields: &[&str],
    counts: &Arc<Counts>,
) {
    let func_name = func.to_string();
    let field_names: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    let counts = Arc::clone(counts);
    supplier.register_plugin(Arc::new(FnPlugin::new(func, move |args: Vec<Value>| {
        let func_name = func_name.clone();
        let field_names = field_names.clone();
        let counts = Arc::clone(&counts);
        async move {
            *counts.lock().unwrap().entry(func_name).or_insert(0) += 1;
            let value = args.first().cloned().unwrap_or(json!("x"));
            Ok(field_names
                .iter()
                .map(|f| (f.clone(), value.clone()))
                .collect::<SupplyResponse>())
        }
    })));
}

/// Plugin that always fails, counted like the identity one.
pub fn register_failing(supplier: &DefaultSupplier, func: &str, counts: &Arc<Counts>) {
    let func_name = func.to_string();
    let counts = Arc::clone(counts);
    supplier.register_plugin(Arc::new(FnPlugin::new(func, move |_args: Vec<Value>| {
        let func_name = func_name.clone();
        let counts = Arc::clone(&counts);
        async move {
            *counts.lock().unwrap().entry(func_name).or_insert(0) += 1;
            Err::<SupplyResponse, _>(SupplyError::Failed("boom".into()))
        }
    })));
}

pub fn var_params(names: &[&str]) -> Vec<Param> {
    var_params_with(names, ParamOnError::Prune)
}

pub fn var_params_with(names: &[&str], on_error: ParamOnError) -> Vec<Param> {
    names
        .iter()
        .map(|name| {
            Param::variable(VarParamSpec::new(*name, *name, ValueType::String).with_on_error(on_error))
                .unwrap()
        })
        .collect()
}

pub fn string_fields(codes: &[&str]) -> Vec<Field> {
    codes
        .iter()
        .map(|code| Field::new(*code, ValueType::String))
        .collect()
}

pub fn build_node(
    supplier: &Arc<DefaultSupplier>,
    func: &str,
    params: Vec<Param>,
    fields: Vec<Field>,
) -> Node {
    Node::new(NodeSpec::new(
        Arc::clone(supplier) as Arc<dyn Supplier>,
        func,
        params,
        fields,
    ))
    .unwrap()
}

pub fn run_params(pairs: &[(&str, &str)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}
