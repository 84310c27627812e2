use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use qtl_query::Direction;
use qtl_query::QueryBuilder;
use qtl_query::QueryError;
use qtl_templates::BinaryOperator;
use qtl_templates::KeywordArg;
use qtl_templates::Location;
use qtl_templates::Node;
use qtl_templates::UnaryOperator;
use rustc_hash::FxHashMap;
use serde_json::Value as JsonValue;

use crate::context::Context;
use crate::error::EngineError;
use crate::extensions::ContentBlocks;
use crate::extensions::ExtensionRegistry;
use crate::extensions::FilterArgs;
use crate::extensions::FilterRunner;
use crate::extensions::TagRunner;
use crate::value::Value;

/// Largest sequence the `range` global produces.
const MAX_RANGE_LEN: usize = 100_000;

/// Renders compiled templates with the run-time halves of registered
/// extensions.
pub struct RuntimeEnvironment {
    tag_runners: FxHashMap<String, Arc<dyn TagRunner>>,
    filter_runners: FxHashMap<String, Arc<dyn FilterRunner>>,
}

impl RuntimeEnvironment {
    pub fn new(registry: &ExtensionRegistry) -> Self {
        let tag_runners = registry
            .tag_runners()
            .iter()
            .map(|runner| (runner.name(), Arc::clone(runner)))
            .collect();
        let filter_runners = registry
            .filter_runners()
            .iter()
            .map(|runner| (runner.filter_name().to_string(), Arc::clone(runner)))
            .collect();

        Self {
            tag_runners,
            filter_runners,
        }
    }

    pub async fn render(&self, root: &Node, context: &mut Context) -> Result<String, EngineError> {
        self.render_node(root, context).await
    }

    pub(crate) fn render_node<'a>(
        &'a self,
        node: &'a Node,
        context: &'a mut Context,
    ) -> BoxFuture<'a, Result<String, EngineError>> {
        async move {
            let mut output = String::new();
            match node {
                Node::Root { children, .. } | Node::NodeList { children, .. } => {
                    output.push_str(&self.render_nodes(children, context).await?);
                }
                Node::Output { children, .. } => {
                    for child in children {
                        match child {
                            Node::TemplateData { value, .. } => output.push_str(value),
                            expression => {
                                output.push_str(&self.eval(expression, context).await?.render());
                            }
                        }
                    }
                }
                Node::TemplateData { value, .. } => output.push_str(value),
                Node::If {
                    cond,
                    body,
                    else_body,
                    ..
                } => {
                    let branch = if self.eval(cond, context).await?.is_truthy() {
                        body
                    } else {
                        else_body
                    };
                    output.push_str(&self.render_nodes(branch, context).await?);
                }
                Node::For {
                    targets,
                    iter,
                    body,
                    else_body,
                    ..
                } => {
                    let iterable = self.eval(iter, context).await?;
                    output.push_str(
                        &self
                            .render_for(targets, iterable, body, else_body, context)
                            .await?,
                    );
                }
                Node::Set { targets, value, .. } => {
                    let value = self.eval(value, context).await?;
                    for target in targets {
                        context.assign(target, value.clone());
                    }
                }
                Node::ExtensionCall {
                    extension,
                    args,
                    content,
                    loc,
                } => {
                    let runner = self.tag_runners.get(extension).ok_or_else(|| {
                        EngineError::internal(format!(
                            "Extension `{extension}` has no runner (at {loc})"
                        ))
                    })?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg, context).await?);
                    }
                    let blocks = ContentBlocks::new(self, content);
                    if let Some(text) = runner.run(context, values, blocks).await? {
                        output.push_str(&text);
                    }
                }
                expression => output.push_str(&self.eval(expression, context).await?.render()),
            }
            Ok(output)
        }
        .boxed()
    }

    async fn render_nodes(&self, nodes: &[Node], context: &mut Context) -> Result<String, EngineError> {
        let mut output = String::new();
        for node in nodes {
            output.push_str(&self.render_node(node, context).await?);
        }
        Ok(output)
    }

    async fn render_for(
        &self,
        targets: &[String],
        iterable: Value,
        body: &[Node],
        else_body: &[Node],
        context: &mut Context,
    ) -> Result<String, EngineError> {
        let items: Vec<Vec<Value>> = match iterable {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Array(parts) if targets.len() > 1 => parts,
                    item => vec![item],
                })
                .collect(),
            Value::Object(entries) => entries
                .into_iter()
                .map(|(key, value)| vec![Value::String(key), value])
                .collect(),
            _ => Vec::new(),
        };

        if items.is_empty() {
            return self.render_nodes(else_body, context).await;
        }

        context.push_frame();
        let length = items.len();
        let mut output = String::new();
        let mut result = Ok(());
        for (index, parts) in items.into_iter().enumerate() {
            for (target, value) in targets.iter().zip(parts.into_iter().chain(std::iter::repeat(Value::Undefined))) {
                context.assign(target, value);
            }
            context.assign("loop", loop_object(index, length));
            match self.render_nodes(body, context).await {
                Ok(text) => output.push_str(&text),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        context.pop_frame();

        result.map(|()| output)
    }

    /// Evaluates an expression node.
    pub(crate) fn eval<'a>(
        &'a self,
        node: &'a Node,
        context: &'a mut Context,
    ) -> BoxFuture<'a, Result<Value, EngineError>> {
        async move {
            Ok(match node {
                Node::Literal { value, .. } => Value::from(value.clone()),
                Node::TemplateData { value, .. } => Value::String(value.clone()),
                Node::Symbol { name, .. } => context.lookup(name).cloned().unwrap_or_default(),
                Node::LookupVal { target, key, .. } => {
                    let target = self.eval(target, context).await?;
                    let key = self.eval(key, context).await?;
                    target.get_attr(&key)
                }
                Node::FunCall {
                    callee, args, loc, ..
                } => self.call(callee, args, *loc, context).await?,
                Node::Filter {
                    name,
                    args,
                    kwargs,
                    loc,
                } => self.apply_filter(name, args, kwargs, *loc, context).await?,
                Node::Array { items, .. } => Value::Array(self.eval_all(items, context).await?),
                Node::Dict { pairs, .. } => {
                    let mut entries = IndexMap::with_capacity(pairs.len());
                    for (key, value) in pairs {
                        let key = self.eval(key, context).await?.render();
                        let value = self.eval(value, context).await?;
                        entries.insert(key, value);
                    }
                    Value::Object(entries)
                }
                Node::BinOp {
                    op, left, right, ..
                } => self.binary(*op, left, right, context).await?,
                Node::UnaryOp { op, operand, .. } => {
                    let value = self.eval(operand, context).await?;
                    match op {
                        UnaryOperator::Not => Value::Bool(!value.is_truthy()),
                        UnaryOperator::Neg => Value::number(-value.as_f64().unwrap_or(f64::NAN)),
                        UnaryOperator::Pos => Value::number(value.as_f64().unwrap_or(f64::NAN)),
                    }
                }
                Node::InlineIf {
                    cond,
                    body,
                    else_body,
                    ..
                } => {
                    if self.eval(cond, context).await?.is_truthy() {
                        self.eval(body, context).await?
                    } else if let Some(else_body) = else_body {
                        self.eval(else_body, context).await?
                    } else {
                        Value::Undefined
                    }
                }
                Node::Capture { body, .. } => Value::String(self.render_nodes(body, context).await?),
                other => {
                    return Err(EngineError::internal(format!(
                        "Unexpected {} node in expression (at {})",
                        other.kind(),
                        other.loc()
                    )))
                }
            })
        }
        .boxed()
    }

    async fn eval_all(&self, nodes: &[Node], context: &mut Context) -> Result<Vec<Value>, EngineError> {
        let mut values = Vec::with_capacity(nodes.len());
        for node in nodes {
            values.push(self.eval(node, context).await?);
        }
        Ok(values)
    }

    async fn binary(
        &self,
        op: BinaryOperator,
        left: &Node,
        right: &Node,
        context: &mut Context,
    ) -> Result<Value, EngineError> {
        let left = self.eval(left, context).await?;
        match op {
            BinaryOperator::And if !left.is_truthy() => return Ok(left),
            BinaryOperator::Or if left.is_truthy() => return Ok(left),
            BinaryOperator::And | BinaryOperator::Or => return self.eval(right, context).await,
            _ => {}
        }
        let right = self.eval(right, context).await?;

        Ok(match op {
            BinaryOperator::In => Value::Bool(contains(&right, &left)?),
            BinaryOperator::NotIn => Value::Bool(!contains(&right, &left)?),
            BinaryOperator::Eq => Value::Bool(left.loose_eq(&right)),
            BinaryOperator::Ne => Value::Bool(!left.loose_eq(&right)),
            BinaryOperator::Lt => Value::Bool(left.compare(&right).is_some_and(|o| o.is_lt())),
            BinaryOperator::Le => Value::Bool(left.compare(&right).is_some_and(|o| o.is_le())),
            BinaryOperator::Gt => Value::Bool(left.compare(&right).is_some_and(|o| o.is_gt())),
            BinaryOperator::Ge => Value::Bool(left.compare(&right).is_some_and(|o| o.is_ge())),
            BinaryOperator::Concat => Value::String(left.render() + &right.render()),
            arithmetic => arithmetic_op(arithmetic, &left, &right),
        })
    }

    async fn call(
        &self,
        callee: &Node,
        args: &[Node],
        loc: Location,
        context: &mut Context,
    ) -> Result<Value, EngineError> {
        match callee {
            Node::LookupVal { target, key, .. } => {
                let receiver = self.eval(target, context).await?;
                if let (Value::Builder(builder), Some(method)) = (&receiver, key.as_str_literal()) {
                    let args = self.eval_all(args, context).await?;
                    return call_builder_method(builder, method, args, loc).await;
                }
            }
            Node::Symbol { name, .. } if name == "range" && context.lookup(name).is_none() => {
                let args = self.eval_all(args, context).await?;
                return range(&args, loc);
            }
            _ => {}
        }

        Err(EngineError::internal(format!(
            "Unable to call `{}`, which is not a function (at {loc})",
            callee_path(callee)
        )))
    }

    async fn apply_filter(
        &self,
        name: &str,
        args: &[Node],
        kwargs: &[KeywordArg],
        loc: Location,
        context: &mut Context,
    ) -> Result<Value, EngineError> {
        let runner = self
            .filter_runners
            .get(name)
            .ok_or_else(|| EngineError::internal(format!("Filter `{name}` has no runner (at {loc})")))?;

        let mut values = self.eval_all(args, context).await?;
        let target = if values.is_empty() {
            Value::Undefined
        } else {
            values.remove(0)
        };
        let mut keyword = IndexMap::with_capacity(kwargs.len());
        for kwarg in kwargs {
            keyword.insert(kwarg.name.clone(), self.eval(&kwarg.value, context).await?);
        }

        runner
            .transform(
                context,
                target,
                FilterArgs {
                    positional: values,
                    keyword,
                },
            )
            .await
    }
}

/// Runs `builder` and collects its rows into an array of objects.
pub(crate) async fn execute_builder(builder: &QueryBuilder) -> Result<Value, EngineError> {
    let result = builder.value().await?;
    let rows = result.collect().await.map_err(QueryError::from)?;
    Ok(Value::Array(
        rows.into_iter()
            .map(|row| Value::from(JsonValue::Object(row)))
            .collect(),
    ))
}

async fn call_builder_method(
    builder: &Arc<QueryBuilder>,
    method: &str,
    args: Vec<Value>,
    loc: Location,
) -> Result<Value, EngineError> {
    let argument = |index: usize| -> Result<JsonValue, EngineError> {
        args.get(index)
            .and_then(Value::to_json)
            .ok_or_else(|| {
                EngineError::internal(format!(
                    "`{method}` expects a value for argument {} (at {loc})",
                    index + 1
                ))
            })
    };

    match method {
        "limit" => {
            builder.limit(argument(0)?);
        }
        "offset" => {
            builder.offset(argument(0)?);
        }
        "take" => {
            builder.take(argument(0)?, argument(1)?);
        }
        "groupBy" | "group_by" => {
            let mut columns = Vec::new();
            for arg in &args {
                match arg {
                    Value::Array(items) => columns.extend(items.iter().map(Value::render)),
                    other => columns.push(other.render()),
                }
            }
            builder.group_by(columns);
        }
        "orderBy" | "order_by" => {
            let column = args.first().map(Value::render).ok_or_else(|| {
                EngineError::internal(format!("`{method}` expects a column (at {loc})"))
            })?;
            let direction = match args.get(1) {
                Some(direction) => direction
                    .render()
                    .parse::<Direction>()
                    .map_err(|err| EngineError::internal(format!("{err} (at {loc})")))?,
                None => Direction::Asc,
            };
            builder.order_by(column, direction);
        }
        "clone" => return Ok(Value::Builder(Arc::new(builder.fork()))),
        "value" => return execute_builder(builder).await,
        other => {
            return Err(EngineError::internal(format!(
                "Unknown query builder method `{other}` (at {loc})"
            )))
        }
    }

    Ok(Value::Builder(Arc::clone(builder)))
}

fn callee_path(callee: &Node) -> String {
    match callee {
        Node::Symbol { name, .. } => name.clone(),
        Node::LookupVal { target, key, .. } => {
            format!("{}.{}", callee_path(target), key.as_str_literal().unwrap_or("?"))
        }
        other => other.kind().to_string(),
    }
}

fn loop_object(index: usize, length: usize) -> Value {
    let int = |value: usize| Value::Int(i64::try_from(value).unwrap_or(i64::MAX));
    Value::Object(IndexMap::from([
        ("index".to_string(), int(index + 1)),
        ("index0".to_string(), int(index)),
        ("revindex".to_string(), int(length - index)),
        ("first".to_string(), Value::Bool(index == 0)),
        ("last".to_string(), Value::Bool(index + 1 == length)),
        ("length".to_string(), int(length)),
    ]))
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, EngineError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| item.loose_eq(needle))),
        Value::Object(entries) => Ok(entries.contains_key(&needle.render())),
        Value::String(text) => Ok(text.contains(&needle.render())),
        other => Err(EngineError::internal(format!(
            "Cannot use \"in\" operator to search in a value of type {}",
            other.type_name()
        ))),
    }
}

fn arithmetic_op(op: BinaryOperator, left: &Value, right: &Value) -> Value {
    if op == BinaryOperator::Add
        && (matches!(left, Value::String(_)) || matches!(right, Value::String(_)))
    {
        return Value::String(left.render() + &right.render());
    }

    if let (Value::Int(l), Value::Int(r)) = (left, right) {
        let exact = match op {
            BinaryOperator::Add => l.checked_add(*r),
            BinaryOperator::Sub => l.checked_sub(*r),
            BinaryOperator::Mul => l.checked_mul(*r),
            BinaryOperator::Mod => l.checked_rem(*r),
            BinaryOperator::Pow => u32::try_from(*r).ok().and_then(|exp| l.checked_pow(exp)),
            _ => None,
        };
        if let Some(value) = exact {
            return Value::Int(value);
        }
    }

    let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
        return Value::Float(f64::NAN);
    };
    Value::number(match op {
        BinaryOperator::Add => l + r,
        BinaryOperator::Sub => l - r,
        BinaryOperator::Mul => l * r,
        BinaryOperator::Div => l / r,
        BinaryOperator::FloorDiv => (l / r).floor(),
        BinaryOperator::Mod => l % r,
        BinaryOperator::Pow => l.powf(r),
        _ => f64::NAN,
    })
}

fn range(args: &[Value], loc: Location) -> Result<Value, EngineError> {
    let int = |value: &Value| -> Result<i64, EngineError> {
        match value {
            Value::Int(value) => Ok(*value),
            other => Err(EngineError::internal(format!(
                "range expects integers, got {} (at {loc})",
                other.type_name()
            ))),
        }
    };

    let (start, stop, step) = match args {
        [stop] => (0, int(stop)?, 1),
        [start, stop] => (int(start)?, int(stop)?, 1),
        [start, stop, step] => (int(start)?, int(stop)?, int(step)?),
        _ => {
            return Err(EngineError::internal(format!(
                "range expects 1 to 3 arguments (at {loc})"
            )))
        }
    };
    if step == 0 {
        return Err(EngineError::internal(format!("range step cannot be zero (at {loc})")));
    }

    let mut values = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        if values.len() == MAX_RANGE_LEN {
            return Err(EngineError::internal(format!("range is too large (at {loc})")));
        }
        values.push(Value::Int(current));
        match current.checked_add(step) {
            Some(next) => current = next,
            None => break,
        }
    }
    Ok(Value::Array(values))
}

#[cfg(test)]
mod tests {
    use qtl_templates::parse_template;
    use qtl_templates::NoExtensions;

    use super::*;
    use crate::context::ExecutionMetadata;

    async fn render(source: &str, context: &mut Context) -> Result<String, EngineError> {
        let root = parse_template(source, &NoExtensions)?;
        RuntimeEnvironment::new(&ExtensionRegistry::new())
            .render(&root, context)
            .await
    }

    fn context() -> Context {
        Context::new(ExecutionMetadata::default())
    }

    #[tokio::test]
    async fn test_outputs_and_arithmetic() {
        let mut ctx = context();
        ctx.set_variable("n", Value::Int(7));
        let out = render("{{ n + 1 }}|{{ n / 2 }}|{{ n // 2 }}|{{ n % 4 }}|{{ 'a' + n }}", &mut ctx)
            .await
            .unwrap();
        assert_eq!(out, "8|3.5|3|3|a7");
    }

    #[tokio::test]
    async fn test_if_and_comparisons() {
        let mut ctx = context();
        ctx.set_variable("age", Value::Int(20));
        let out = render(
            "{% if age >= 18 and not (age > 65) %}adult{% else %}other{% endif %}",
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(out, "adult");
    }

    #[tokio::test]
    async fn test_for_loop_exposes_loop_variables() {
        let mut ctx = context();
        let out = render(
            "{% for x in [1, 2, 3] %}{{ x }}{% if not loop.last %},{% endif %}{% endfor %}",
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(out, "1,2,3");
    }

    #[tokio::test]
    async fn test_for_over_object_and_else() {
        let mut ctx = context();
        let out = render(
            "{% for k, v in {a: 1, b: 2} %}{{ k }}={{ v }};{% endfor %}{% for x in [] %}x{% else %}empty{% endfor %}",
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(out, "a=1;b=2;empty");
    }

    #[tokio::test]
    async fn test_set_is_exported_at_top_level() {
        let mut ctx = context();
        let out = render("{% set greeting = 'hi' %}{{ greeting }}", &mut ctx)
            .await
            .unwrap();
        assert_eq!(out, "hi");
        assert_eq!(ctx.exports()["greeting"].render(), "hi");
    }

    #[tokio::test]
    async fn test_in_operator_and_range() {
        let mut ctx = context();
        let out = render(
            "{{ 2 in range(3) }}|{{ 'b' in 'abc' }}|{{ 'z' not in {z: 1} }}",
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(out, "true|true|false");
    }

    #[tokio::test]
    async fn test_unknown_filter_is_internal() {
        let mut ctx = context();
        let err = render("{{ 1 | shout }}", &mut ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[tokio::test]
    async fn test_calling_a_non_function_is_internal() {
        let mut ctx = context();
        let err = render("{{ user.name() }}", &mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("user.name"));
    }
}
