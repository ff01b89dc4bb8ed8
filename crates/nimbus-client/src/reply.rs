use nimbus_core::{Item, Message, ReplyBody, Result, StorageError};

use crate::validate::validate;

fn decode(method: &str, message: &Message) -> Result<ReplyBody> {
    message
        .decode()
        .map_err(|e| StorageError::LocalComms(format!("{method}: malformed reply: {e}")))
}

fn unexpected(method: &str, body: &ReplyBody) -> StorageError {
    StorageError::LocalComms(format!("{method}: unexpected reply {body:?}"))
}

pub(crate) fn expect_item(method: &str, message: &Message) -> Result<Item> {
    match decode(method, message)? {
        ReplyBody::Item(md) => validate(method, md),
        other => Err(unexpected(method, &other)),
    }
}

pub(crate) fn expect_items(method: &str, message: &Message) -> Result<Vec<Item>> {
    match decode(method, message)? {
        ReplyBody::Items(items) => items.into_iter().map(|md| validate(method, md)).collect(),
        other => Err(unexpected(method, &other)),
    }
}

/// Like [`expect_items`], for calls that always find at least one item.
pub(crate) fn expect_some_items(method: &str, message: &Message) -> Result<Vec<Item>> {
    let items = expect_items(method, message)?;
    if items.is_empty() {
        return Err(StorageError::LocalComms(format!(
            "{method}: provider returned an empty list"
        )));
    }
    Ok(items)
}

/// One page of a listing and the token for the next, empty on the last page.
pub(crate) fn expect_page(method: &str, message: &Message) -> Result<(Vec<Item>, String)> {
    match decode(method, message)? {
        ReplyBody::Page {
            items,
            next_page_token,
        } => {
            let items = items
                .into_iter()
                .map(|md| validate(method, md))
                .collect::<Result<Vec<_>>>()?;
            Ok((items, next_page_token))
        }
        other => Err(unexpected(method, &other)),
    }
}

pub(crate) fn expect_empty(method: &str, message: &Message) -> Result<()> {
    match decode(method, message)? {
        ReplyBody::Empty => Ok(()),
        other => Err(unexpected(method, &other)),
    }
}

pub(crate) fn expect_transfer(method: &str, message: &Message) -> Result<String> {
    match decode(method, message)? {
        ReplyBody::Transfer { id } => Ok(id),
        other => Err(unexpected(method, &other)),
    }
}
