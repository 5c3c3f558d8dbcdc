/// PostgreSQL-backed `Store`.
///
/// Each item is one row keyed by `(partition_key, sort_key)` with the full
/// attribute map stored as JSON. The attributes the table layer queries on
/// are copied into their own columns: `wave_height` for filters and
/// conditional puts, `month` and `month_day` for the two statistics indexes.
///
/// Batch writes run in one transaction, so a batch is either written whole
/// or fails; nothing is ever reported unprocessed. Conditional puts are a
/// single `INSERT .. ON CONFLICT DO UPDATE .. WHERE`, which Postgres
/// evaluates atomically against the row it conflicts with.

use std::collections::BTreeMap;

use postgres::types::ToSql;
use postgres::{Client, NoTls, Row};
use tracing::debug;

use super::{
    AttributeValue, Condition, Cursor, Item, KeyCondition, Page, Query, Store, ATTR_MONTH,
    ATTR_MONTH_DAY, ATTR_WAVE_HEIGHT,
};
use crate::model::StoreError;

pub const DEFAULT_PAGE_SIZE: usize = 500;

type SqlParam = Box<dyn ToSql + Sync>;

pub struct PgStore {
    client: Client,
    table: String,
    page_size: usize,
}

/// Table names are interpolated into SQL, so only plain identifiers are
/// accepted.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}

impl PgStore {
    /// Connects and creates the table and its indexes if missing.
    pub fn connect(database_url: &str, table: &str) -> Result<Self, StoreError> {
        if !is_plain_identifier(table) {
            return Err(StoreError::Unsupported(format!(
                "table name '{}' is not a plain identifier",
                table
            )));
        }
        let client = Client::connect(database_url, NoTls)?;
        let mut store = PgStore {
            client,
            table: table.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Removes every row in the given partitions. Returns rows deleted.
    pub fn delete_partitions(&mut self, partition_keys: &[&str]) -> Result<u64, StoreError> {
        let keys: Vec<String> = partition_keys.iter().map(|k| k.to_string()).collect();
        let deleted = self.client.execute(
            &format!("DELETE FROM {} WHERE partition_key = ANY($1)", self.table),
            &[&keys],
        )?;
        debug!("deleted {} rows from {}", deleted, self.table);
        Ok(deleted)
    }

    fn ensure_schema(&mut self) -> Result<(), StoreError> {
        let t = &self.table;
        self.client.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                partition_key TEXT NOT NULL,
                sort_key      TEXT NOT NULL,
                wave_height   DOUBLE PRECISION,
                month         INTEGER,
                month_day     TEXT,
                attributes    TEXT NOT NULL,
                PRIMARY KEY (partition_key, sort_key)
            );
            CREATE INDEX IF NOT EXISTS {t}_month_idx ON {t} (partition_key, month, sort_key);
            CREATE INDEX IF NOT EXISTS {t}_month_day_idx ON {t} (partition_key, month_day, sort_key);"
        ))?;
        Ok(())
    }

    fn upsert_sql(&self) -> String {
        let t = &self.table;
        format!(
            "INSERT INTO {t} (partition_key, sort_key, wave_height, month, month_day, attributes)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (partition_key, sort_key) DO UPDATE SET
                wave_height = EXCLUDED.wave_height,
                month = EXCLUDED.month,
                month_day = EXCLUDED.month_day,
                attributes = EXCLUDED.attributes"
        )
    }
}

/// Column values for one item.
struct ItemRow {
    partition_key: String,
    sort_key: String,
    wave_height: Option<f64>,
    month: Option<i32>,
    month_day: Option<String>,
    attributes: String,
}

impl ItemRow {
    fn from_item(item: &Item) -> Result<Self, StoreError> {
        Ok(ItemRow {
            partition_key: item.partition_key()?.to_string(),
            sort_key: item.sort_key()?.to_string(),
            wave_height: item.optional_f64(ATTR_WAVE_HEIGHT),
            month: item.optional_f64(ATTR_MONTH).map(|m| m as i32),
            month_day: item
                .get(ATTR_MONTH_DAY)
                .and_then(AttributeValue::as_str)
                .map(String::from),
            attributes: serde_json::to_string(&item.attributes)?,
        })
    }
}

fn item_from_row(row: &Row) -> Result<Item, StoreError> {
    let attributes: String = row.try_get("attributes")?;
    let attributes: BTreeMap<String, AttributeValue> = serde_json::from_str(&attributes)?;
    Ok(Item { attributes })
}

/// Maps an attribute used in a condition or filter to its column.
fn indexed_column(attribute: &str) -> Result<&'static str, StoreError> {
    match attribute {
        ATTR_WAVE_HEIGHT => Ok("wave_height"),
        other => Err(StoreError::Unsupported(format!(
            "attribute '{}' has no column",
            other
        ))),
    }
}

impl Store for PgStore {
    fn batch_put(&mut self, items: Vec<Item>) -> Result<Vec<Item>, StoreError> {
        let rows = items
            .iter()
            .map(ItemRow::from_item)
            .collect::<Result<Vec<_>, _>>()?;
        let sql = self.upsert_sql();

        let mut tx = self.client.transaction()?;
        let statement = tx.prepare(&sql)?;
        for r in &rows {
            tx.execute(
                &statement,
                &[
                    &r.partition_key,
                    &r.sort_key,
                    &r.wave_height,
                    &r.month,
                    &r.month_day,
                    &r.attributes,
                ],
            )?;
        }
        tx.commit()?;
        debug!("upserted {} rows into {}", rows.len(), self.table);
        Ok(Vec::new())
    }

    fn conditional_put(&mut self, item: Item, condition: &Condition) -> Result<(), StoreError> {
        let r = ItemRow::from_item(&item)?;
        let Condition::AbsentOrLessThan { attribute, value } = condition;
        let column = indexed_column(attribute)?;
        let sql = format!(
            "{} WHERE {}.{} < $7",
            self.upsert_sql(),
            self.table,
            column
        );

        let affected = self.client.execute(
            &sql,
            &[
                &r.partition_key,
                &r.sort_key,
                &r.wave_height,
                &r.month,
                &r.month_day,
                &r.attributes,
                value,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::ConditionFailed {
                partition_key: r.partition_key,
                sort_key: r.sort_key,
            });
        }
        Ok(())
    }

    fn query(&mut self, query: &Query, cursor: Option<&Cursor>) -> Result<Page, StoreError> {
        let mut params: Vec<SqlParam> = vec![Box::new(query.partition_key.clone())];
        let mut sql = format!(
            "SELECT sort_key, attributes FROM {} WHERE partition_key = $1",
            self.table
        );

        match &query.key_condition {
            KeyCondition::SortKeyPrefix(None) => {}
            KeyCondition::SortKeyPrefix(Some(prefix)) => {
                params.push(Box::new(prefix.clone()));
                sql.push_str(&format!(" AND starts_with(sort_key, ${})", params.len()));
            }
            KeyCondition::Month(month) => {
                params.push(Box::new(*month as i32));
                sql.push_str(&format!(" AND month = ${}", params.len()));
            }
            KeyCondition::MonthDay(month_day) => {
                params.push(Box::new(month_day.clone()));
                sql.push_str(&format!(" AND month_day = ${}", params.len()));
            }
        }

        if let Some(Cursor(after)) = cursor {
            params.push(Box::new(after.clone()));
            let op = if query.descending { "<" } else { ">" };
            sql.push_str(&format!(" AND sort_key {} ${}", op, params.len()));
        }

        let budget = query
            .limit
            .map_or(self.page_size, |limit| limit.min(self.page_size));
        // One extra row tells whether another page exists.
        params.push(Box::new((budget + 1) as i64));
        sql.push_str(&format!(
            " ORDER BY sort_key {} LIMIT ${}",
            if query.descending { "DESC" } else { "ASC" },
            params.len()
        ));

        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref()).collect();
        let mut rows = self.client.query(&sql, &refs)?;

        let more = rows.len() > budget;
        rows.truncate(budget);
        let cursor = if more {
            rows.last()
                .map(|row| row.try_get::<_, String>("sort_key"))
                .transpose()?
                .map(Cursor)
        } else {
            None
        };

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let item = item_from_row(row)?;
            if query.filter.as_ref().is_none_or(|f| f.matches(&item)) {
                items.push(item);
            }
        }
        Ok(Page { items, cursor })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_identifiers() {
        assert!(is_plain_identifier("buoy_observations"));
        assert!(is_plain_identifier("_t1"));
        assert!(!is_plain_identifier("1table"));
        assert!(!is_plain_identifier("Buoy"));
        assert!(!is_plain_identifier("obs; DROP TABLE x"));
        assert!(!is_plain_identifier(""));
    }

    #[test]
    fn test_only_wave_height_has_a_column() {
        assert_eq!(indexed_column("waveheight").unwrap(), "wave_height");
        assert!(matches!(
            indexed_column("domperiod"),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_row_columns_follow_item_attributes() {
        let mut item = Item::new("46013", "2024011512");
        item.set("waveheight", AttributeValue::number(2.5));
        item.set("month", AttributeValue::number(1));
        item.set("monthday", AttributeValue::string("0115"));
        let row = ItemRow::from_item(&item).unwrap();
        assert_eq!(row.wave_height, Some(2.5));
        assert_eq!(row.month, Some(1));
        assert_eq!(row.month_day.as_deref(), Some("0115"));

        let back: BTreeMap<String, AttributeValue> = serde_json::from_str(&row.attributes).unwrap();
        assert_eq!(back, item.attributes);
    }
}
