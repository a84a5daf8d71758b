//! Conversions between JSON values and DynamoDB attribute maps.
//!
//! The table API and the streams API expose distinct `AttributeValue`
//! types, so each direction gets its own small converter. Binary and set
//! attributes never occur in our tables and map to `Null`.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue as TableAttr;
use aws_sdk_dynamodbstreams::types::AttributeValue as StreamAttr;
use serde_json::{json, Map, Value};

pub fn item_from_json(value: &Value) -> HashMap<String, TableAttr> {
    match value {
        Value::Object(fields) => fields
            .iter()
            .map(|(key, field)| (key.clone(), table_attr_from_json(field)))
            .collect(),
        _ => HashMap::new(),
    }
}

fn table_attr_from_json(value: &Value) -> TableAttr {
    match value {
        Value::Null => TableAttr::Null(true),
        Value::Bool(b) => TableAttr::Bool(*b),
        Value::Number(n) => TableAttr::N(n.to_string()),
        Value::String(s) => TableAttr::S(s.clone()),
        Value::Array(items) => TableAttr::L(items.iter().map(table_attr_from_json).collect()),
        Value::Object(fields) => TableAttr::M(
            fields
                .iter()
                .map(|(key, field)| (key.clone(), table_attr_from_json(field)))
                .collect(),
        ),
    }
}

pub fn json_from_item(item: &HashMap<String, TableAttr>) -> Value {
    let mut fields = Map::new();
    for (key, attr) in item {
        fields.insert(key.clone(), json_from_table_attr(attr));
    }
    Value::Object(fields)
}

fn json_from_table_attr(attr: &TableAttr) -> Value {
    match attr {
        TableAttr::S(s) => json!(s),
        TableAttr::N(n) => number_from_str(n),
        TableAttr::Bool(b) => json!(b),
        TableAttr::L(items) => Value::Array(items.iter().map(json_from_table_attr).collect()),
        TableAttr::M(fields) => {
            let mut map = Map::new();
            for (key, field) in fields {
                map.insert(key.clone(), json_from_table_attr(field));
            }
            Value::Object(map)
        }
        _ => Value::Null,
    }
}

pub fn json_from_stream_image(image: &HashMap<String, StreamAttr>) -> Value {
    let mut fields = Map::new();
    for (key, attr) in image {
        fields.insert(key.clone(), json_from_stream_attr(attr));
    }
    Value::Object(fields)
}

fn json_from_stream_attr(attr: &StreamAttr) -> Value {
    match attr {
        StreamAttr::S(s) => json!(s),
        StreamAttr::N(n) => number_from_str(n),
        StreamAttr::Bool(b) => json!(b),
        StreamAttr::L(items) => Value::Array(items.iter().map(json_from_stream_attr).collect()),
        StreamAttr::M(fields) => {
            let mut map = Map::new();
            for (key, field) in fields {
                map.insert(key.clone(), json_from_stream_attr(field));
            }
            Value::Object(map)
        }
        _ => Value::Null,
    }
}

fn number_from_str(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        return json!(int);
    }
    match raw.parse::<f64>() {
        Ok(float) => json!(float),
        Err(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trips_through_table_attributes() {
        let value = json!({
            "id": "h1",
            "query": "apple iphone launch",
            "sentiment_score": 0.25,
            "was_summarized": false,
            "headline_meta": {
                "source": "NewsAPI",
                "title": "Apple launches new iPhone"
            },
            "tags": ["a", "b"]
        });

        let item = item_from_json(&value);
        assert_eq!(json_from_item(&item), value);
    }

    #[test]
    fn numbers_come_back_typed() {
        let item = item_from_json(&json!({"int": 42, "float": 1.5}));
        let back = json_from_item(&item);
        assert_eq!(back["int"], json!(42));
        assert_eq!(back["float"], json!(1.5));
    }
}
