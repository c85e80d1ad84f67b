//! Generic parameter inference
//!
//! Bindings come from unifying the runtime type tags of concrete arguments
//! against the declared parameter types. Tags must match exactly; `Null`
//! offers no evidence.

use std::collections::BTreeMap;

use crate::models::{ParamDecl, ParamType, TypeTag, Value};

pub type Bindings = BTreeMap<String, TypeTag>;

/// Infer generic bindings from every row of one expansion
pub fn infer(
    params: &[ParamDecl],
    type_params: &[String],
    rows: &[&[Value]],
) -> Result<Bindings, String> {
    let mut slots: Vec<&str> = type_params.iter().map(String::as_str).collect();
    for param in params {
        for slot in param.ty.generic_slots() {
            if !slots.contains(&slot) {
                slots.push(slot);
            }
        }
    }
    if slots.is_empty() {
        return Ok(Bindings::new());
    }

    let mut bindings = Bindings::new();
    for row in rows {
        for (param, value) in params.iter().zip(row.iter()) {
            unify(&param.ty, value, &mut bindings)?;
        }
    }

    if let Some(slot) = slots.iter().find(|slot| !bindings.contains_key(**slot)) {
        return Err(format!(
            "Type parameter '{slot}' could not be inferred from the supplied arguments"
        ));
    }
    Ok(bindings)
}

fn unify(ty: &ParamType, value: &Value, bindings: &mut Bindings) -> Result<(), String> {
    match (ty, value) {
        (ParamType::Generic(slot), value) => {
            let Some(tag) = value.type_tag() else {
                return Ok(());
            };
            match bindings.get(slot) {
                Some(bound) if *bound != tag => Err(format!(
                    "Type parameter '{slot}' has conflicting types: {bound} and {tag}"
                )),
                Some(_) => Ok(()),
                None => {
                    bindings.insert(slot.clone(), tag);
                    Ok(())
                }
            }
        }
        (ParamType::List(inner), Value::List(items)) => {
            for item in items {
                unify(inner, item, bindings)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Check one row against the declared signature
pub fn check_arguments(
    params: &[ParamDecl],
    values: &[Value],
    bindings: &Bindings,
) -> Result<(), String> {
    if params.len() != values.len() {
        return Err(format!(
            "Parameter count mismatch: expected {} argument(s) but got {}",
            params.len(),
            values.len()
        ));
    }
    for (param, value) in params.iter().zip(values) {
        if !accepts(&param.ty, value, bindings) {
            let actual = value
                .type_tag()
                .map(|tag| tag.to_string())
                .unwrap_or_else(|| "null".to_string());
            return Err(format!(
                "Argument '{}' expects {} but got {}",
                param.name, param.ty, actual
            ));
        }
    }
    Ok(())
}

fn accepts(ty: &ParamType, value: &Value, bindings: &Bindings) -> bool {
    if value.is_null() {
        return true;
    }
    match (ty, value) {
        (ParamType::Any, _) => true,
        (ParamType::Bool, Value::Bool(_))
        | (ParamType::Int, Value::Int(_))
        | (ParamType::Float, Value::Float(_))
        | (ParamType::Str, Value::Str(_))
        | (ParamType::Record, Value::Record(_)) => true,
        (ParamType::List(inner), Value::List(items)) => {
            items.iter().all(|item| accepts(inner, item, bindings))
        }
        (ParamType::Generic(slot), value) => bindings.get(slot) == value.type_tag().as_ref(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic(name: &str) -> Vec<ParamDecl> {
        vec![ParamDecl::new(name.to_lowercase(), ParamType::Generic(name.to_string()))]
    }

    #[test]
    fn test_infers_from_rows() {
        let rows = [vec![Value::Int(1)], vec![Value::Int(2)]];
        let rows: Vec<&[Value]> = rows.iter().map(Vec::as_slice).collect();
        let bindings = infer(&generic("T"), &["T".to_string()], &rows).unwrap();
        assert_eq!(bindings.get("T"), Some(&TypeTag::Int));
    }

    #[test]
    fn test_zero_arguments_cannot_infer() {
        let empty: [&[Value]; 1] = [&[]];
        let err = infer(&generic("T"), &["T".to_string()], &empty).unwrap_err();
        assert!(err.contains("could not be inferred"));
    }

    #[test]
    fn test_null_offers_no_evidence() {
        let row = [Value::Null];
        let err = infer(&generic("T"), &[], &[&row[..]]).unwrap_err();
        assert!(err.contains("'T' could not be inferred"));
    }

    #[test]
    fn test_conflicting_rows() {
        let rows = [vec![Value::Int(1)], vec![Value::from("one")]];
        let rows: Vec<&[Value]> = rows.iter().map(Vec::as_slice).collect();
        let err = infer(&generic("T"), &["T".to_string()], &rows).unwrap_err();
        assert!(err.contains("conflicting types"));
    }

    #[test]
    fn test_int_and_float_do_not_unify() {
        let params = vec![
            ParamDecl::new("a", ParamType::Generic("T".into())),
            ParamDecl::new("b", ParamType::Generic("T".into())),
        ];
        let row = [Value::Int(1), Value::Float(1.5)];
        assert!(infer(&params, &[], &[&row[..]])
            .unwrap_err()
            .contains("conflicting types"));
    }

    #[test]
    fn test_list_elements_bind_slot() {
        let params = vec![ParamDecl::new(
            "items",
            ParamType::List(Box::new(ParamType::Generic("T".into()))),
        )];
        let row = [Value::List(vec![Value::Null, Value::from("x")])];
        let bindings = infer(&params, &["T".to_string()], &[&row[..]]).unwrap();
        assert_eq!(bindings.get("T"), Some(&TypeTag::Str));
    }

    #[test]
    fn test_check_arguments() {
        let params = vec![
            ParamDecl::new("a", ParamType::Int),
            ParamDecl::new("b", ParamType::Any),
        ];
        let bindings = Bindings::new();
        assert!(check_arguments(&params, &[Value::Int(1), Value::from("x")], &bindings).is_ok());
        assert!(check_arguments(&params, &[Value::Int(1)], &bindings)
            .unwrap_err()
            .starts_with("Parameter count mismatch"));
        assert_eq!(
            check_arguments(&params, &[Value::from("1"), Value::Null], &bindings).unwrap_err(),
            "Argument 'a' expects int but got str"
        );
    }
}
