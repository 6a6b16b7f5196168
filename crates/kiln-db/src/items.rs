use std::collections::BTreeMap;

use async_trait::async_trait;
use kiln_engine::{OrderStore, StoreError};
use kiln_schemas::{ItemPatch, LocalItem, Order};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::is_invariant_error;

#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ItemRow {
    serial_number: String,
    order_id: String,
    upstream_line_item_id: String,
    title: String,
    item_type: String,
    specifications: Json<BTreeMap<String, String>>,
    is_archived: bool,
    archived_reason: Option<String>,
    status: String,
}

impl From<ItemRow> for LocalItem {
    fn from(r: ItemRow) -> Self {
        LocalItem {
            serial_number: r.serial_number,
            order_id: r.order_id,
            upstream_line_item_id: r.upstream_line_item_id,
            title: r.title,
            item_type: r.item_type,
            specifications: r.specifications.0,
            is_archived: r.is_archived,
            archived_reason: r.archived_reason,
            status: r.status,
        }
    }
}

fn read(e: sqlx::Error) -> StoreError {
    StoreError::ReadFailed(e.to_string())
}

fn write(e: sqlx::Error) -> StoreError {
    if is_invariant_error(&e) {
        StoreError::InvariantViolation(e.to_string())
    } else {
        StoreError::WriteFailed(e.to_string())
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let row: Option<(String, String, Option<String>)> = sqlx::query_as(
            "select order_id, order_number, upstream_order_id from orders where order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(read)?;
        Ok(row.map(|(id, number, upstream)| Order::new(id, number, upstream)))
    }

    async fn get_order_items(&self, order_id: &str) -> Result<Vec<LocalItem>, StoreError> {
        let rows: Vec<ItemRow> = sqlx::query_as(
            r#"
            select serial_number, order_id, upstream_line_item_id, title, item_type,
                   specifications, is_archived, archived_reason, status
            from local_items
            where order_id = $1
            order by serial_number
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(read)?;
        Ok(rows.into_iter().map(LocalItem::from).collect())
    }

    async fn create_item(&self, item: &LocalItem) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into local_items (
              serial_number, order_id, upstream_line_item_id, title, item_type,
              specifications, is_archived, archived_reason, status
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&item.serial_number)
        .bind(&item.order_id)
        .bind(&item.upstream_line_item_id)
        .bind(&item.title)
        .bind(&item.item_type)
        .bind(Json(&item.specifications))
        .bind(item.is_archived)
        .bind(item.archived_reason.as_deref())
        .bind(&item.status)
        .execute(&self.pool)
        .await
        .map_err(write)?;
        Ok(())
    }

    async fn update_item(&self, serial_number: &str, patch: &ItemPatch) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            update local_items set
              title           = coalesce($2, title),
              item_type       = coalesce($3, item_type),
              specifications  = coalesce($4, specifications),
              is_archived     = coalesce($5, is_archived),
              archived_reason = case when $6 then $7 else archived_reason end,
              status          = coalesce($8, status),
              updated_at_utc  = now()
            where serial_number = $1
            "#,
        )
        .bind(serial_number)
        .bind(patch.title.as_deref())
        .bind(patch.item_type.as_deref())
        .bind(patch.specifications.as_ref().map(Json))
        .bind(patch.is_archived)
        .bind(patch.archived_reason.is_some())
        .bind(patch.archived_reason.clone().flatten())
        .bind(patch.status.as_deref())
        .execute(&self.pool)
        .await
        .map_err(write)?;

        if res.rows_affected() == 0 {
            return Err(StoreError::WriteFailed(format!(
                "no local item with serial_number={serial_number}"
            )));
        }
        Ok(())
    }
}
