#![allow(dead_code)]

use datamapper_core::{
    downcast_all, downcast_one, shared, unknown_field, BeforeCreate, BeforeUpdate, Cascade,
    Column, Connection, Entity, EntityRef, ExecResult, Fetch, FromValue, HookError, Metadata,
    Orm, OrmConfig, OrmResult, Record, Relation, Shared, SqliteConnection, Transaction, Value,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const SCHEMA: &str = "
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE articles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    author_id INTEGER REFERENCES users(id)
);
CREATE TABLE user_infos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    user_id INTEGER REFERENCES users(id)
);
CREATE TABLE comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL,
    article_id INTEGER REFERENCES articles(id)
);
";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(1)
}

#[derive(Debug, Default)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created: i64,
    pub updated: i64,
    pub articles: Vec<Shared<Article>>,
    pub info: Option<Shared<UserInfo>>,
}

impl User {
    pub fn add_articles(&mut self, articles: &[Shared<Article>]) {
        for article in articles {
            if self.id != 0 {
                article.borrow_mut().author_id = Some(self.id);
            }
            self.articles.push(article.clone());
        }
    }
}

impl Entity for User {
    fn metadata() -> Metadata {
        Metadata::new("User", "users")
            .column(Column::id("id"))
            .column(Column::new("name"))
            .column(Column::new("email"))
            .column(Column::new("created"))
            .column(Column::new("updated"))
            .relation(
                Relation::one_to_many("articles", "Article", "author_id")
                    .mapped_by("author")
                    .fetch(Fetch::Eager)
                    .cascade(Cascade::PERSIST | Cascade::REMOVE),
            )
            .relation(
                Relation::one_to_one("info", "UserInfo", "user_id")
                    .cascade(Cascade::PERSIST | Cascade::REMOVE),
            )
    }

    fn field_value(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::Integer(self.id)),
            "name" => Some(Value::Text(self.name.clone())),
            "email" => Some(Value::Text(self.email.clone())),
            "created" => Some(Value::Integer(self.created)),
            "updated" => Some(Value::Integer(self.updated)),
            _ => None,
        }
    }

    fn set_field_value(&mut self, field: &str, value: Value) -> OrmResult<()> {
        match field {
            "id" => self.id = FromValue::from_value(field, value)?,
            "name" => self.name = FromValue::from_value(field, value)?,
            "email" => self.email = FromValue::from_value(field, value)?,
            "created" => self.created = FromValue::from_value(field, value)?,
            "updated" => self.updated = FromValue::from_value(field, value)?,
            _ => return Err(unknown_field::<Self>(field)),
        }
        Ok(())
    }

    fn related(&self, field: &str) -> Vec<EntityRef> {
        match field {
            "articles" => self.articles.iter().map(EntityRef::new).collect(),
            "info" => self.info.iter().map(EntityRef::new).collect(),
            _ => Vec::new(),
        }
    }

    fn attach_related(&mut self, field: &str, related: Vec<EntityRef>) -> OrmResult<()> {
        match field {
            "articles" => self.articles = downcast_all(related)?,
            "info" => self.info = downcast_one(related)?,
            _ => return Err(unknown_field::<Self>(field)),
        }
        Ok(())
    }

    fn as_before_create(&mut self) -> Option<&mut dyn BeforeCreate> {
        Some(self)
    }

    fn as_before_update(&mut self) -> Option<&mut dyn BeforeUpdate> {
        Some(self)
    }
}

impl BeforeCreate for User {
    fn before_create(&mut self) -> Result<(), HookError> {
        self.created = now_millis();
        self.updated = self.created;
        Ok(())
    }
}

impl BeforeUpdate for User {
    fn before_update(&mut self) -> Result<(), HookError> {
        self.updated = now_millis();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub created: i64,
    pub updated: i64,
    pub author_id: Option<i64>,
    pub author: Option<Shared<User>>,
}

impl Entity for Article {
    fn metadata() -> Metadata {
        Metadata::new("Article", "articles")
            .column(Column::id("id"))
            .column(Column::new("title"))
            .column(Column::new("content"))
            .column(Column::new("created"))
            .column(Column::new("updated"))
            .column(Column::new("author_id"))
            .relation(Relation::many_to_one("author", "User", "author_id"))
    }

    fn field_value(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::Integer(self.id)),
            "title" => Some(Value::Text(self.title.clone())),
            "content" => Some(Value::Text(self.content.clone())),
            "created" => Some(Value::Integer(self.created)),
            "updated" => Some(Value::Integer(self.updated)),
            "author_id" => Some(self.author_id.map_or(Value::Null, Value::Integer)),
            _ => None,
        }
    }

    fn set_field_value(&mut self, field: &str, value: Value) -> OrmResult<()> {
        match field {
            "id" => self.id = FromValue::from_value(field, value)?,
            "title" => self.title = FromValue::from_value(field, value)?,
            "content" => self.content = FromValue::from_value(field, value)?,
            "created" => self.created = FromValue::from_value(field, value)?,
            "updated" => self.updated = FromValue::from_value(field, value)?,
            "author_id" => self.author_id = FromValue::from_value(field, value)?,
            _ => return Err(unknown_field::<Self>(field)),
        }
        Ok(())
    }

    fn related(&self, field: &str) -> Vec<EntityRef> {
        match field {
            "author" => self.author.iter().map(EntityRef::new).collect(),
            _ => Vec::new(),
        }
    }

    fn attach_related(&mut self, field: &str, related: Vec<EntityRef>) -> OrmResult<()> {
        match field {
            "author" => self.author = downcast_one(related)?,
            _ => return Err(unknown_field::<Self>(field)),
        }
        Ok(())
    }

    fn as_before_create(&mut self) -> Option<&mut dyn BeforeCreate> {
        Some(self)
    }

    fn as_before_update(&mut self) -> Option<&mut dyn BeforeUpdate> {
        Some(self)
    }
}

impl BeforeCreate for Article {
    fn before_create(&mut self) -> Result<(), HookError> {
        if self.title.trim().is_empty() {
            return Err("article title must not be empty".into());
        }
        self.created = now_millis();
        self.updated = self.created;
        Ok(())
    }
}

impl BeforeUpdate for Article {
    fn before_update(&mut self) -> Result<(), HookError> {
        self.updated = now_millis();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct UserInfo {
    pub id: i64,
    pub display_name: String,
    pub user_id: Option<i64>,
}

impl Entity for UserInfo {
    fn metadata() -> Metadata {
        Metadata::new("UserInfo", "user_infos")
            .column(Column::id("id"))
            .column(Column::new("display_name"))
            .column(Column::new("user_id"))
    }

    fn field_value(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::Integer(self.id)),
            "display_name" => Some(Value::Text(self.display_name.clone())),
            "user_id" => Some(self.user_id.map_or(Value::Null, Value::Integer)),
            _ => None,
        }
    }

    fn set_field_value(&mut self, field: &str, value: Value) -> OrmResult<()> {
        match field {
            "id" => self.id = FromValue::from_value(field, value)?,
            "display_name" => self.display_name = FromValue::from_value(field, value)?,
            "user_id" => self.user_id = FromValue::from_value(field, value)?,
            _ => return Err(unknown_field::<Self>(field)),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Comment {
    pub id: i64,
    pub body: String,
    pub article_id: Option<i64>,
    pub article: Option<Shared<Article>>,
}

impl Entity for Comment {
    fn metadata() -> Metadata {
        Metadata::new("Comment", "comments")
            .column(Column::id("id"))
            .column(Column::new("body"))
            .column(Column::new("article_id"))
            .relation(
                Relation::many_to_one("article", "Article", "article_id").fetch(Fetch::Eager),
            )
    }

    fn field_value(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::Integer(self.id)),
            "body" => Some(Value::Text(self.body.clone())),
            "article_id" => Some(self.article_id.map_or(Value::Null, Value::Integer)),
            _ => None,
        }
    }

    fn set_field_value(&mut self, field: &str, value: Value) -> OrmResult<()> {
        match field {
            "id" => self.id = FromValue::from_value(field, value)?,
            "body" => self.body = FromValue::from_value(field, value)?,
            "article_id" => self.article_id = FromValue::from_value(field, value)?,
            _ => return Err(unknown_field::<Self>(field)),
        }
        Ok(())
    }

    fn related(&self, field: &str) -> Vec<EntityRef> {
        match field {
            "article" => self.article.iter().map(EntityRef::new).collect(),
            _ => Vec::new(),
        }
    }

    fn attach_related(&mut self, field: &str, related: Vec<EntityRef>) -> OrmResult<()> {
        match field {
            "article" => self.article = downcast_one(related)?,
            _ => return Err(unknown_field::<Self>(field)),
        }
        Ok(())
    }
}

pub fn new_user(name: &str, email: &str) -> Shared<User> {
    shared(User {
        name: name.to_string(),
        email: email.to_string(),
        ..User::default()
    })
}

pub fn new_article(title: &str) -> Shared<Article> {
    shared(Article {
        title: title.to_string(),
        content: format!("{title} body"),
        ..Article::default()
    })
}

fn schema_connection() -> SqliteConnection {
    let conn = SqliteConnection::open_in_memory().unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    conn
}

fn register_all(orm: &mut Orm) {
    orm.register::<User>().unwrap();
    orm.register::<Article>().unwrap();
    orm.register::<UserInfo>().unwrap();
    orm.register::<Comment>().unwrap();
}

/// In-memory ORM with every fixture entity registered.
pub fn open_orm() -> Orm {
    open_orm_with_config(OrmConfig::default())
}

pub fn open_orm_with_config(config: OrmConfig) -> Orm {
    let mut orm = Orm::with_config(schema_connection(), config);
    register_all(&mut orm);
    orm
}

/// Observed traffic of a `RecordingConnection`.
#[derive(Debug, Default)]
pub struct Traffic {
    pub selects: Cell<usize>,
    pub writes: RefCell<Vec<String>>,
}

impl Traffic {
    pub fn reset(&self) {
        self.selects.set(0);
        self.writes.borrow_mut().clear();
    }
}

/// Connection wrapper counting SELECTs and recording write statements.
pub struct RecordingConnection {
    inner: SqliteConnection,
    traffic: Rc<Traffic>,
}

impl Connection for RecordingConnection {
    fn exec(&self, sql: &str, params: &[Value]) -> OrmResult<ExecResult> {
        self.traffic.writes.borrow_mut().push(sql.to_string());
        self.inner.exec(sql, params)
    }

    fn select(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Record>> {
        self.traffic.selects.set(self.traffic.selects.get() + 1);
        self.inner.select(sql, params)
    }

    fn begin_transaction(&self) -> OrmResult<Box<dyn Transaction + '_>> {
        Ok(Box::new(RecordingTransaction {
            inner: self.inner.begin_transaction()?,
            traffic: &self.traffic,
        }))
    }
}

struct RecordingTransaction<'conn> {
    inner: Box<dyn Transaction + 'conn>,
    traffic: &'conn Traffic,
}

impl Transaction for RecordingTransaction<'_> {
    fn exec(&mut self, sql: &str, params: &[Value]) -> OrmResult<ExecResult> {
        self.traffic.writes.borrow_mut().push(sql.to_string());
        self.inner.exec(sql, params)
    }

    fn commit(self: Box<Self>) -> OrmResult<()> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> OrmResult<()> {
        self.inner.rollback()
    }
}

/// In-memory ORM whose connection traffic can be observed.
pub fn open_recording_orm() -> (Orm, Rc<Traffic>) {
    let traffic = Rc::new(Traffic::default());
    let connection = RecordingConnection {
        inner: schema_connection(),
        traffic: Rc::clone(&traffic),
    };
    let mut orm = Orm::new(connection);
    register_all(&mut orm);
    (orm, traffic)
}

/// Counts rows with plain SQL, independent of the ORM read path.
pub fn row_count(orm: &Orm, table: &str) -> i64 {
    let record = orm
        .connection()
        .get(&format!("SELECT COUNT(*) AS total FROM {table} ;"), &[])
        .unwrap();
    i64::from_value("total", record.get("total").cloned().unwrap()).unwrap()
}
